//! Change notification.
//!
//! A [`Signal`] fans an event out to connected callbacks. Connecting returns a
//! [`Connection`] that removes the callback when disconnected; disconnecting
//! twice is a no-op.

use std::{
    fmt,
    sync::{Arc, Mutex, Weak},
};

type Slot<A> = Arc<dyn Fn(&A) + Send + Sync>;

struct Slots<A> {
    next_id: u64,
    slots: Vec<(u64, Slot<A>)>,
}

/// Multi-subscriber change signal.
pub struct Signal<A> {
    inner: Arc<Mutex<Slots<A>>>,
}

impl<A: 'static> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: 'static> Signal<A> {
    /// Create a signal with no receivers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Connect a callback.
    pub fn connect<F>(&self, callback: F) -> Connection
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.slots.push((id, Arc::new(callback)));
            id
        };

        let weak: Weak<Mutex<Slots<A>>> = Arc::downgrade(&self.inner);
        Connection::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .slots
                    .retain(|(slot_id, _)| *slot_id != id);
            }
        })
    }

    /// Invoke every connected callback.
    ///
    /// Callbacks run outside the signal's lock, so they may connect or
    /// disconnect freely.
    pub fn emit(&self, arg: &A) {
        let slots: Vec<Slot<A>> = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .slots
            .iter()
            .map(|(_, slot)| Arc::clone(slot))
            .collect();
        for slot in slots {
            slot(arg);
        }
    }

    /// Number of connected callbacks.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .slots
            .len()
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").finish_non_exhaustive()
    }
}

/// Handle to a connected callback.
///
/// Dropping a connection does not disconnect it.
pub struct Connection {
    disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl Connection {
    /// Wrap a disconnect action.
    #[must_use]
    pub fn new(disconnect: impl FnOnce() + Send + 'static) -> Self {
        Self {
            disconnect: Some(Box::new(disconnect)),
        }
    }

    /// A connection with nothing to disconnect.
    #[must_use]
    pub fn noop() -> Self {
        Self { disconnect: None }
    }

    /// Disconnect the callback. Later calls do nothing.
    pub fn disconnect(&mut self) {
        if let Some(disconnect) = self.disconnect.take() {
            disconnect();
        }
    }

    /// Whether this connection can still disconnect something.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.disconnect.is_some()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}
