//! Collaborators shared by every session of a runtime.

use std::{fmt, path::PathBuf, sync::Arc};

use reflow_core::{
    CacheStorageManager, MediaFileManager, RuntimeConfig, Signal, UploadedFileManager,
};
use reflow_pages::SourceWatcherFactory;
use reflow_runner::{ScriptCache, ScriptRunnerFactory};

/// Everything a session needs from the process around it.
///
/// Cloning shares the collaborators; the signals stay connected to the
/// same receivers.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<RuntimeConfig>,
    pub uploaded_file_mgr: Arc<dyn UploadedFileManager>,
    pub media_file_mgr: Arc<dyn MediaFileManager>,
    pub cache_storage_mgr: Arc<dyn CacheStorageManager>,
    pub script_cache: Arc<ScriptCache>,
    pub runner_factory: Arc<dyn ScriptRunnerFactory>,
    pub watcher_factory: Arc<dyn SourceWatcherFactory>,
    /// Fired with the secrets file path when it changes.
    pub secrets_changed: Signal<PathBuf>,
    /// Fired after the config file was re-read.
    pub config_changed: Signal<()>,
}

#[cfg(feature = "memory")]
impl SessionServices {
    /// Services with in-memory managers, threaded runners and local file
    /// watching.
    #[must_use]
    pub fn new(config: RuntimeConfig, loader: Arc<dyn reflow_runner::ScriptLoader>) -> Self {
        use crate::storage::{
            MemoryCacheStorageManager, MemoryMediaFileManager, MemoryUploadedFileManager,
        };

        let watcher_factory =
            reflow_pages::LocalSourcesWatcherFactory::new(config.server.file_watcher_type);
        Self {
            config: Arc::new(config),
            uploaded_file_mgr: Arc::new(MemoryUploadedFileManager::default()),
            media_file_mgr: Arc::new(MemoryMediaFileManager::new()),
            cache_storage_mgr: Arc::new(MemoryCacheStorageManager::new()),
            script_cache: Arc::new(ScriptCache::new(loader)),
            runner_factory: Arc::new(reflow_runner::ThreadedRunnerFactory),
            watcher_factory: Arc::new(watcher_factory),
            secrets_changed: Signal::new(),
            config_changed: Signal::new(),
        }
    }
}

impl SessionServices {
    #[must_use]
    pub fn with_uploaded_file_mgr(mut self, mgr: Arc<dyn UploadedFileManager>) -> Self {
        self.uploaded_file_mgr = mgr;
        self
    }

    #[must_use]
    pub fn with_media_file_mgr(mut self, mgr: Arc<dyn MediaFileManager>) -> Self {
        self.media_file_mgr = mgr;
        self
    }

    #[must_use]
    pub fn with_cache_storage_mgr(mut self, mgr: Arc<dyn CacheStorageManager>) -> Self {
        self.cache_storage_mgr = mgr;
        self
    }

    #[must_use]
    pub fn with_runner_factory(mut self, factory: Arc<dyn ScriptRunnerFactory>) -> Self {
        self.runner_factory = factory;
        self
    }

    #[must_use]
    pub fn with_watcher_factory(mut self, factory: Arc<dyn SourceWatcherFactory>) -> Self {
        self.watcher_factory = factory;
        self
    }
}

impl fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServices")
            .field("config", &self.config)
            .field("script_cache", &self.script_cache)
            .finish_non_exhaustive()
    }
}
