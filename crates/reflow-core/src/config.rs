//! Runtime configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Runtime configuration, read from a TOML file with camelCase keys.
///
/// ```toml
/// [runner]
/// fastReruns = false
///
/// [server]
/// runOnSave = true
/// fileWatcherType = "poll"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub runner: RunnerConfig,
    pub server: ServerConfig,
    pub global: GlobalConfig,
    pub theme: Option<ThemeConfig>,
}

impl RuntimeConfig {
    /// Parse a config from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not a valid config.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "Loaded runtime config");
        Ok(config)
    }
}

/// Script runner options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Stop the running script and start a new runner on every full rerun
    /// instead of handing the request to the running script.
    pub fast_reruns: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { fast_reruns: true }
    }
}

/// Server options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Rerun automatically when a source file changes.
    pub run_on_save: bool,
    /// Whether clients may toggle run-on-save.
    pub allow_run_on_save: bool,
    pub file_watcher_type: FileWatcherType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            run_on_save: false,
            allow_run_on_save: true,
            file_watcher_type: FileWatcherType::Auto,
        }
    }
}

/// How source files are watched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileWatcherType {
    /// Native filesystem events.
    #[default]
    Auto,
    /// Periodic polling.
    Poll,
    /// No watching.
    None,
}

/// Options shared with the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Number of runs a cached message survives on the client.
    pub max_cached_message_age: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_cached_message_age: 2,
        }
    }
}

/// Theme section, passed through to the client untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ThemeConfig {
    pub base: Option<String>,
    pub primary_color: Option<String>,
    pub background_color: Option<String>,
    pub secondary_background_color: Option<String>,
    pub text_color: Option<String>,
    pub font: Option<String>,
}
