//! Pages of a multipage app.
//!
//! Provides:
//! - `PagesManager` - Resolve pages by hash or name and track the active page
//! - Page discovery for the `pages/` directory convention
//! - `DirWatcher` / `LocalSourcesWatcher` - Filesystem change notification

pub mod manager;
pub mod source;
pub mod watcher;

use std::path::PathBuf;

use thiserror::Error;

pub use manager::{PagesManager, PagesStrategy};
pub use source::{calc_page_hash, discover_pages, page_icon_and_name, page_sort_key};
pub use watcher::{
    DirWatcher, FileChangeCallback, LocalSourcesWatcher, LocalSourcesWatcherFactory, SourceWatcher,
    SourceWatcherFactory,
};

/// Pages error.
#[derive(Debug, Error)]
pub enum PagesError {
    #[error("Duplicate page hash: {0}")]
    DuplicatePageHash(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("File watching is disabled")]
    WatchingDisabled,
}
