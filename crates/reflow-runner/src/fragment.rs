//! Independently rerunnable parts of a script.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{ScriptError, context::ScriptRunContext};

/// A fragment body.
pub trait Fragment: Send + Sync {
    /// Run the fragment.
    ///
    /// # Errors
    /// Same as [`crate::Script::run`].
    fn run(&self, ctx: &mut ScriptRunContext) -> Result<(), ScriptError>;
}

impl<F> Fragment for F
where
    F: Fn(&mut ScriptRunContext) -> Result<(), ScriptError> + Send + Sync,
{
    fn run(&self, ctx: &mut ScriptRunContext) -> Result<(), ScriptError> {
        self(ctx)
    }
}

/// Fragments registered by a session's script, keyed by fragment id.
///
/// Shared between the session's event loop and its runner thread.
pub trait FragmentStorage: Send + Sync {
    fn set(&self, fragment_id: &str, fragment: Arc<dyn Fragment>);

    fn get(&self, fragment_id: &str) -> Option<Arc<dyn Fragment>>;

    fn contains(&self, fragment_id: &str) -> bool;

    /// Drop every fragment.
    fn clear(&self);

    /// Drop fragments whose ids are not in `fragment_ids`.
    fn retain_only(&self, fragment_ids: &HashSet<String>);
}

/// In-memory fragment storage.
#[derive(Default)]
pub struct MemoryFragmentStorage {
    fragments: RwLock<HashMap<String, Arc<dyn Fragment>>>,
}

impl MemoryFragmentStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fragments.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FragmentStorage for MemoryFragmentStorage {
    fn set(&self, fragment_id: &str, fragment: Arc<dyn Fragment>) {
        self.fragments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fragment_id.to_string(), fragment);
    }

    fn get(&self, fragment_id: &str) -> Option<Arc<dyn Fragment>> {
        self.fragments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fragment_id)
            .cloned()
    }

    fn contains(&self, fragment_id: &str) -> bool {
        self.fragments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(fragment_id)
    }

    fn clear(&self) {
        self.fragments.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn retain_only(&self, fragment_ids: &HashSet<String>) {
        self.fragments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| fragment_ids.contains(id));
    }
}

impl fmt::Debug for MemoryFragmentStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryFragmentStorage")
            .field("len", &self.len())
            .finish()
    }
}
