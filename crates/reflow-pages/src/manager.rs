//! Page resolution and tracking for one app.

use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use reflow_core::{Connection, FileWatcherType, PageHash, PageInfo, Signal};
use tracing::{debug, warn};

use crate::{
    PagesError,
    source::{calc_page_hash, discover_pages, page_info_for, pages_dir_for},
    watcher::DirWatcher,
};

/// Where the page set comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagesStrategy {
    /// Scripts discovered in the `pages/` directory.
    Directory,
    /// Pages declared by the running script.
    Declared,
}

#[derive(Debug)]
struct PagesState {
    current_page_script_hash: PageHash,
    /// `None` when the directory listing must be re-read.
    pages: Option<Vec<PageInfo>>,
    strategy: PagesStrategy,
}

/// Resolves pages to scripts and tracks the active page.
pub struct PagesManager {
    main_script_path: PathBuf,
    main_script_hash: PageHash,
    state: Arc<RwLock<PagesState>>,
    pages_changed: Signal<PathBuf>,
    dir_watcher: Mutex<Option<DirWatcher>>,
}

impl PagesManager {
    /// Create a manager for an app.
    ///
    /// If a `pages/` directory exists next to the main script, pages come
    /// from it and, unless `watcher_type` is `None`, it is watched for
    /// changes. Otherwise the app starts with no pages until the script
    /// declares some.
    pub fn new(main_script_path: impl Into<PathBuf>, watcher_type: FileWatcherType) -> Self {
        let main_script_path = main_script_path.into();
        let main_script_hash = calc_page_hash(&main_script_path);
        let pages_dir = pages_dir_for(&main_script_path);

        let strategy = if pages_dir.is_dir() {
            PagesStrategy::Directory
        } else {
            PagesStrategy::Declared
        };
        let pages = match strategy {
            PagesStrategy::Directory => None,
            PagesStrategy::Declared => Some(Vec::new()),
        };

        let manager = Self {
            main_script_path,
            main_script_hash,
            state: Arc::new(RwLock::new(PagesState {
                current_page_script_hash: PageHash::new(),
                pages,
                strategy,
            })),
            pages_changed: Signal::new(),
            dir_watcher: Mutex::new(None),
        };

        if strategy == PagesStrategy::Directory && watcher_type != FileWatcherType::None {
            manager.install_pages_watcher(&pages_dir, watcher_type);
        }
        manager
    }

    fn install_pages_watcher(&self, pages_dir: &Path, watcher_type: FileWatcherType) {
        let state = Arc::clone(&self.state);
        let signal = self.pages_changed.clone();
        let extension = self
            .main_script_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned());

        let watcher = DirWatcher::new(pages_dir, extension, watcher_type, move |path| {
            invalidate(&state);
            signal.emit(&path.to_path_buf());
        });

        match watcher {
            Ok(watcher) => {
                *self.dir_watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
            }
            Err(e) => warn!(path = %pages_dir.display(), error = %e, "Failed to watch pages directory"),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PagesState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PagesState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn main_script_path(&self) -> &Path {
        &self.main_script_path
    }

    #[must_use]
    pub fn main_script_hash(&self) -> &str {
        &self.main_script_hash
    }

    /// The directory holding the main script.
    #[must_use]
    pub fn main_script_parent(&self) -> &Path {
        self.main_script_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Current page set, main page first in directory mode.
    pub fn get_pages(&self) -> Vec<PageInfo> {
        if let Some(pages) = &self.read().pages {
            return pages.clone();
        }

        let mut state = self.write();
        if let Some(pages) = &state.pages {
            return pages.clone();
        }
        let pages = match discover_pages(&self.main_script_path) {
            Ok(pages) => pages,
            Err(e) => {
                warn!(error = %e, "Failed to discover pages");
                vec![self.get_main_page()]
            }
        };
        debug!(count = pages.len(), "Discovered pages");
        state.pages = Some(pages.clone());
        pages
    }

    /// Replace the page set with pages declared by the script.
    ///
    /// Switching away from directory mode is logged once and cannot be
    /// undone.
    ///
    /// # Errors
    /// Returns error if two pages share a hash.
    pub fn set_pages(&self, pages: Vec<PageInfo>) -> Result<(), PagesError> {
        let mut seen = HashSet::new();
        for page in &pages {
            if !seen.insert(page.page_script_hash.as_str()) {
                return Err(PagesError::DuplicatePageHash(page.page_script_hash.clone()));
            }
        }

        let mut state = self.write();
        if state.strategy == PagesStrategy::Directory {
            warn!(
                "Pages were declared in an app with a pages/ directory. \
                 This may cause unusual app behavior. You may want to rename the pages/ directory."
            );
            state.strategy = PagesStrategy::Declared;
            drop(state);
            self.dir_watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
            state = self.write();
        }
        state.pages = Some(pages);
        Ok(())
    }

    /// The main script as a page.
    #[must_use]
    pub fn get_main_page(&self) -> PageInfo {
        let mut page = page_info_for(&self.main_script_path, Some(String::new()));
        page.page_script_hash.clone_from(&self.main_script_hash);
        page
    }

    #[must_use]
    pub fn get_page_script_by_hash(&self, page_script_hash: &str) -> Option<PageInfo> {
        self.get_pages()
            .into_iter()
            .find(|p| p.page_script_hash == page_script_hash)
    }

    /// Look up a page by its URL segment. The empty name is the main page.
    #[must_use]
    pub fn get_page_script_by_name(&self, page_name: &str) -> Option<PageInfo> {
        self.get_pages().into_iter().find(|p| p.url_pathname == page_name)
    }

    /// Resolve a page.
    ///
    /// A non-empty hash wins; otherwise a given name (possibly empty, the
    /// main page) is used; otherwise `fallback_page_hash`, defaulting to the
    /// main script's hash.
    #[must_use]
    pub fn find_page_info(
        &self,
        page_script_hash: &str,
        page_name: Option<&str>,
        fallback_page_hash: Option<&str>,
    ) -> Option<PageInfo> {
        if !page_script_hash.is_empty() {
            return self.get_page_script_by_hash(page_script_hash);
        }
        if let Some(page_name) = page_name {
            return self.get_page_script_by_name(page_name);
        }
        self.get_page_script_by_hash(fallback_page_hash.unwrap_or(&self.main_script_hash))
    }

    #[must_use]
    pub fn current_page_script_hash(&self) -> PageHash {
        self.read().current_page_script_hash.clone()
    }

    pub fn set_current_page_script_hash(&self, page_script_hash: impl Into<PageHash>) {
        self.write().current_page_script_hash = page_script_hash.into();
    }

    #[must_use]
    pub fn strategy(&self) -> PagesStrategy {
        self.read().strategy
    }

    /// 1 for directory pages, 2 for declared pages.
    #[must_use]
    pub fn mpa_version(&self) -> u8 {
        match self.strategy() {
            PagesStrategy::Directory => 1,
            PagesStrategy::Declared => 2,
        }
    }

    /// Call `callback` whenever the pages directory changes.
    ///
    /// Declared pages are never watched; the returned connection is then a
    /// no-op.
    pub fn register_pages_changed_callback<F>(&self, callback: F) -> Connection
    where
        F: Fn(&PathBuf) + Send + Sync + 'static,
    {
        match self.strategy() {
            PagesStrategy::Directory => self.pages_changed.connect(callback),
            PagesStrategy::Declared => Connection::noop(),
        }
    }

    /// Drop the cached page listing and notify listeners.
    pub fn on_pages_changed(&self, path: &Path) {
        invalidate(&self.state);
        self.pages_changed.emit(&path.to_path_buf());
    }

    #[must_use]
    pub fn pages_changed_receiver_count(&self) -> usize {
        self.pages_changed.receiver_count()
    }
}

fn invalidate(state: &RwLock<PagesState>) {
    let mut state = state.write().unwrap_or_else(PoisonError::into_inner);
    if state.strategy == PagesStrategy::Directory {
        state.pages = None;
    }
}

impl fmt::Debug for PagesManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagesManager")
            .field("main_script_path", &self.main_script_path)
            .field("main_script_hash", &self.main_script_hash)
            .finish_non_exhaustive()
    }
}
