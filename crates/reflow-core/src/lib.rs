//! Core abstractions for script rerun sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `ForwardMsg` / `BackMsg` - Typed wire envelopes
//! - `ForwardMsgQueue` - Ordered, deduplicating outbound mailbox
//! - `EventLoop` / `LoopHandle` - Single-threaded callback loop
//! - `Signal` - Change notification with one-shot disconnects
//! - `RerunData` - Immutable rerun intent
//! - Collaborator traits and runtime configuration

pub mod config;
pub mod event_loop;
pub mod protocol;
pub mod queue;
pub mod rerun_data;
pub mod session_state;
pub mod signal;
pub mod traits;

pub use config::{FileWatcherType, RuntimeConfig};
pub use event_loop::{EventLoop, LoopHandle, LoopId};
pub use protocol::{BackMsg, BackMsgKind, ClientState, ForwardMsg, ForwardMsgKind, PageInfo};
pub use queue::ForwardMsgQueue;
pub use rerun_data::{RerunData, coalesce_widget_states};
pub use session_state::{SessionState, SharedSessionState};
pub use signal::{Connection, Signal};
pub use traits::{CacheError, CacheStorageManager, MediaFileManager, UploadFileUrlInfo, UploadedFileManager};

/// Session identifier.
pub type SessionId = String;

/// Content-derived identifier of a page script.
pub type PageHash = String;

/// Arbitrary user metadata attached to a session.
pub type UserInfo = serde_json::Map<String, serde_json::Value>;
