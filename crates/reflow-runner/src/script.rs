//! Scripts and script loading.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use crate::{ScriptError, context::ScriptRunContext};

/// An app script, run top to bottom on every rerun.
pub trait Script: Send + Sync {
    /// Run the script.
    ///
    /// # Errors
    /// Returns `Stop`/`Rerun` when interrupted at a checkpoint, or an
    /// exception the script raised.
    fn run(&self, ctx: &mut ScriptRunContext) -> Result<(), ScriptError>;
}

impl<F> Script for F
where
    F: Fn(&mut ScriptRunContext) -> Result<(), ScriptError> + Send + Sync,
{
    fn run(&self, ctx: &mut ScriptRunContext) -> Result<(), ScriptError> {
        self(ctx)
    }
}

/// Resolves a script path to a runnable script.
pub trait ScriptLoader: Send + Sync {
    /// Load the script at `path`.
    ///
    /// # Errors
    /// Returns `ScriptError::Compile` if the script cannot be loaded.
    fn load(&self, path: &Path) -> Result<Arc<dyn Script>, ScriptError>;
}

/// Loader backed by scripts registered in-process under their paths.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<PathBuf, Arc<dyn Script>>>,
}

impl ScriptRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the script at `path`.
    pub fn register(&self, path: impl Into<PathBuf>, script: impl Script + 'static) {
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), Arc::new(script));
    }

    /// Register a closure as the script at `path`.
    pub fn register_fn<F>(&self, path: impl Into<PathBuf>, script: F)
    where
        F: Fn(&mut ScriptRunContext) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        self.register(path, script);
    }

    /// Remove the script at `path`.
    pub fn unregister(&self, path: &Path) -> bool {
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }
}

impl ScriptLoader for ScriptRegistry {
    fn load(&self, path: &Path) -> Result<Arc<dyn Script>, ScriptError> {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| ScriptError::Compile {
                path: path.to_path_buf(),
                message: "no script registered at this path".to_string(),
            })
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.scripts.read().map_or(0, |s| s.len());
        f.debug_struct("ScriptRegistry").field("scripts", &count).finish()
    }
}

/// Cache of loaded scripts, shared by every session of an app.
pub struct ScriptCache {
    loader: Arc<dyn ScriptLoader>,
    scripts: Mutex<HashMap<PathBuf, Arc<dyn Script>>>,
}

impl ScriptCache {
    #[must_use]
    pub fn new(loader: Arc<dyn ScriptLoader>) -> Self {
        Self {
            loader,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached script at `path`, loading it on a miss.
    ///
    /// # Errors
    /// Returns error if the loader cannot load the script.
    pub fn get_or_load(&self, path: &Path) -> Result<Arc<dyn Script>, ScriptError> {
        if let Some(script) = self.lock().get(path) {
            return Ok(Arc::clone(script));
        }

        let script = self.loader.load(path)?;
        self.lock().insert(path.to_path_buf(), Arc::clone(&script));
        Ok(script)
    }

    /// Forget every loaded script.
    pub fn clear(&self) {
        self.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<dyn Script>>> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ScriptCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptCache").field("len", &self.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingLoader {
        registry: ScriptRegistry,
        loads: AtomicUsize,
    }

    impl ScriptLoader for CountingLoader {
        fn load(&self, path: &Path) -> Result<Arc<dyn Script>, ScriptError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.registry.load(path)
        }
    }

    #[test]
    fn test_registry_unknown_path_is_compile_error() {
        let registry = ScriptRegistry::new();
        let err = registry.load(Path::new("missing.py")).err().unwrap();
        assert!(matches!(err, ScriptError::Compile { .. }));
    }

    #[test]
    fn test_cache_loads_once_until_cleared() {
        let registry = ScriptRegistry::new();
        registry.register_fn("app.py", |_| Ok(()));
        let loader = Arc::new(CountingLoader {
            registry,
            loads: AtomicUsize::new(0),
        });

        let cache = ScriptCache::new(Arc::clone(&loader) as Arc<dyn ScriptLoader>);
        cache.get_or_load(Path::new("app.py")).unwrap();
        cache.get_or_load(Path::new("app.py")).unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        cache.get_or_load(Path::new("app.py")).unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregister() {
        let registry = ScriptRegistry::new();
        registry.register_fn("app.py", |_| Ok(()));
        assert!(registry.unregister(Path::new("app.py")));
        assert!(!registry.unregister(Path::new("app.py")));
    }
}
