//! Filesystem watching for page directories and app sources.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use notify::{Event, PollWatcher, RecursiveMode, Watcher};
use reflow_core::{Connection, FileWatcherType, Signal};
use tracing::{debug, info, warn};

use crate::{PagesError, PagesManager};

/// Poll interval of the polling backend.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

type BoxedWatcher = Box<dyn Watcher + Send>;

fn is_change(event: &Event) -> bool {
    event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove()
}

fn build_watcher<F>(watcher_type: FileWatcherType, handler: F) -> Result<BoxedWatcher, PagesError>
where
    F: Fn(Event) + Send + 'static,
{
    let handler = move |res: notify::Result<Event>| match res {
        Ok(event) if is_change(&event) => handler(event),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "File watcher error"),
    };

    match watcher_type {
        FileWatcherType::Auto => Ok(Box::new(notify::recommended_watcher(handler)?)),
        FileWatcherType::Poll => {
            // Mtimes only have whole-second resolution here; hash contents too.
            let config = notify::Config::default()
                .with_poll_interval(POLL_INTERVAL)
                .with_compare_contents(true);
            Ok(Box::new(PollWatcher::new(handler, config)?))
        }
        FileWatcherType::None => Err(PagesError::WatchingDisabled),
    }
}

/// Watches one directory for changes to files with a given extension.
pub struct DirWatcher {
    dir: PathBuf,
    watcher: BoxedWatcher,
}

impl DirWatcher {
    /// Start watching `dir`. `on_change` receives the changed path.
    ///
    /// # Errors
    /// Returns error if watching is disabled or the watcher cannot start.
    pub fn new<F>(
        dir: &Path,
        extension: Option<String>,
        watcher_type: FileWatcherType,
        on_change: F,
    ) -> Result<Self, PagesError>
    where
        F: Fn(&Path) + Send + 'static,
    {
        let mut watcher = build_watcher(watcher_type, move |event| {
            for path in &event.paths {
                let matches = extension
                    .as_deref()
                    .is_none_or(|ext| path.extension().is_some_and(|e| e == ext));
                if matches {
                    on_change(path);
                }
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        info!(path = %dir.display(), "Directory watcher started");

        Ok(Self {
            dir: dir.to_path_buf(),
            watcher,
        })
    }

    /// The watched directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.watcher.unwatch(&self.dir) {
            debug!(path = %self.dir.display(), error = %e, "Failed to unwatch directory");
        }
    }
}

/// Callback invoked with the path of a changed source file.
pub type FileChangeCallback = Box<dyn Fn(&PathBuf) + Send + Sync>;

/// Watches the scripts of an app and reports which one changed.
pub trait SourceWatcher: Send {
    /// Register a change callback. The returned connection removes it.
    fn register_file_change_callback(&mut self, callback: FileChangeCallback) -> Connection;

    /// Re-read the page set and watch any new page scripts.
    fn update_watched_pages(&mut self);

    /// Stop watching. Later calls do nothing.
    fn close(&mut self);
}

/// Creates a [`SourceWatcher`] for a session.
pub trait SourceWatcherFactory: Send + Sync {
    /// Create a watcher over the app described by `pages_manager`.
    ///
    /// # Errors
    /// Returns error if the underlying watcher cannot start.
    fn create(&self, pages_manager: &Arc<PagesManager>) -> Result<Box<dyn SourceWatcher>, PagesError>;
}

/// Watches the main script and every page script on the local filesystem.
pub struct LocalSourcesWatcher {
    pages_manager: Arc<PagesManager>,
    on_file_changed: Signal<PathBuf>,
    /// Resolved path -> script path as the page set names it.
    watched_files: Arc<Mutex<HashMap<PathBuf, PathBuf>>>,
    watched_dirs: HashSet<PathBuf>,
    watcher: Option<BoxedWatcher>,
}

impl LocalSourcesWatcher {
    /// Start watching the app's sources.
    ///
    /// # Errors
    /// Returns error if watching is disabled or the watcher cannot start.
    pub fn new(pages_manager: Arc<PagesManager>, watcher_type: FileWatcherType) -> Result<Self, PagesError> {
        let on_file_changed: Signal<PathBuf> = Signal::new();
        let watched_files: Arc<Mutex<HashMap<PathBuf, PathBuf>>> = Arc::default();

        let signal = on_file_changed.clone();
        let files = Arc::clone(&watched_files);
        let watcher = build_watcher(watcher_type, move |event| {
            let changed: Vec<PathBuf> = {
                let files = files.lock().unwrap_or_else(PoisonError::into_inner);
                event
                    .paths
                    .iter()
                    .filter_map(|path| files.get(&resolve(path)).cloned())
                    .collect()
            };
            for path in changed {
                debug!(path = %path.display(), "Source file changed");
                signal.emit(&path);
            }
        })?;

        let mut this = Self {
            pages_manager,
            on_file_changed,
            watched_files,
            watched_dirs: HashSet::new(),
            watcher: Some(watcher),
        };
        this.update_watched_pages();
        Ok(this)
    }

    fn watch_file(&mut self, script_path: &Path) {
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };

        let resolved = resolve(script_path);
        let dir = resolved.parent().map(Path::to_path_buf).unwrap_or_default();
        if !self.watched_dirs.contains(&dir) {
            match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    self.watched_dirs.insert(dir);
                }
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Failed to watch source directory");
                    return;
                }
            }
        }

        self.watched_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resolved, script_path.to_path_buf());
    }

    /// Number of script files being watched.
    #[must_use]
    pub fn watched_file_count(&self) -> usize {
        self.watched_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl SourceWatcher for LocalSourcesWatcher {
    fn register_file_change_callback(&mut self, callback: FileChangeCallback) -> Connection {
        self.on_file_changed.connect(move |path| callback(path))
    }

    fn update_watched_pages(&mut self) {
        let main = self.pages_manager.main_script_path().to_path_buf();
        self.watch_file(&main);
        for page in self.pages_manager.get_pages() {
            self.watch_file(&page.script_path);
        }
    }

    fn close(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            for dir in self.watched_dirs.drain() {
                if let Err(e) = watcher.unwatch(&dir) {
                    debug!(path = %dir.display(), error = %e, "Failed to unwatch source directory");
                }
            }
            self.watched_files
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }
}

impl Drop for LocalSourcesWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Creates [`LocalSourcesWatcher`]s with a fixed backend.
#[derive(Debug, Clone, Copy)]
pub struct LocalSourcesWatcherFactory {
    watcher_type: FileWatcherType,
}

impl LocalSourcesWatcherFactory {
    #[must_use]
    pub const fn new(watcher_type: FileWatcherType) -> Self {
        Self { watcher_type }
    }
}

impl SourceWatcherFactory for LocalSourcesWatcherFactory {
    fn create(&self, pages_manager: &Arc<PagesManager>) -> Result<Box<dyn SourceWatcher>, PagesError> {
        Ok(Box::new(LocalSourcesWatcher::new(
            Arc::clone(pages_manager),
            self.watcher_type,
        )?))
    }
}

fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
