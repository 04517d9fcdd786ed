//! Single-threaded callback loop with a thread-safe posting handle.
//!
//! All mutation of a loop's target happens inside callbacks run by the
//! loop's owner. Any thread may post callbacks through a [`LoopHandle`];
//! they run in posting order the next time the owner drives the loop.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    fn next() -> Self {
        Self(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loop-{}", self.0)
    }
}

/// A callback run on the loop. Receives the loop's target and the id of
/// the loop running it.
pub type Callback<T> = Box<dyn FnOnce(&mut T, LoopId) + Send>;

/// Event loop owning the receiving side of the callback channel.
pub struct EventLoop<T> {
    id: LoopId,
    tx: mpsc::UnboundedSender<Callback<T>>,
    rx: mpsc::UnboundedReceiver<Callback<T>>,
    handles: Arc<()>,
}

impl<T: 'static> Default for EventLoop<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> EventLoop<T> {
    /// Create a new loop with a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id: LoopId::next(),
            tx,
            rx,
            handles: Arc::new(()),
        }
    }

    /// This loop's identity.
    #[must_use]
    pub const fn id(&self) -> LoopId {
        self.id
    }

    /// Get a handle for posting callbacks.
    #[must_use]
    pub fn handle(&self) -> LoopHandle<T> {
        LoopHandle {
            id: self.id,
            tx: self.tx.clone(),
            token: Arc::clone(&self.handles),
        }
    }

    /// Number of live handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.handles) - 1
    }

    /// Run every callback already queued. Returns how many ran.
    pub fn run_pending(&mut self, target: &mut T) -> usize {
        let mut ran = 0;
        while let Ok(callback) = self.rx.try_recv() {
            callback(target, self.id);
            ran += 1;
        }
        ran
    }

    /// Wait for at least one callback, then run everything queued.
    /// Returns how many ran.
    pub async fn run_once(&mut self, target: &mut T) -> usize {
        match self.rx.recv().await {
            Some(callback) => {
                callback(target, self.id);
                1 + self.run_pending(target)
            }
            None => 0,
        }
    }
}

impl<T> fmt::Debug for EventLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Posting side of an [`EventLoop`]. Cheap to clone and `Send`.
pub struct LoopHandle<T> {
    id: LoopId,
    tx: mpsc::UnboundedSender<Callback<T>>,
    token: Arc<()>,
}

impl<T> LoopHandle<T> {
    /// Identity of the loop this handle posts to.
    #[must_use]
    pub const fn loop_id(&self) -> LoopId {
        self.id
    }

    /// Schedule a callback. Safe to call from any thread.
    ///
    /// Callbacks posted after the loop is dropped are discarded.
    pub fn call_soon_threadsafe<F>(&self, callback: F)
    where
        F: FnOnce(&mut T, LoopId) + Send + 'static,
    {
        if self.tx.send(Box::new(callback)).is_err() {
            tracing::debug!(loop_id = %self.id, "Event loop closed, dropping callback");
        }
    }
}

impl<T> Clone for LoopHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            token: Arc::clone(&self.token),
        }
    }
}

impl<T> fmt::Debug for LoopHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle").field("id", &self.id).finish_non_exhaustive()
    }
}
