//! App sessions and the runtime that drives them.
//!
//! Provides:
//! - `AppSession` - Per-connection state machine owning one script runner at a time
//! - `SessionServices` - Shared collaborators injected into every session
//! - `Runtime` - Owns sessions and runs each on its own event loop task
//! - In-memory uploaded-file, media-file and cache-storage managers

pub mod runtime;
pub mod services;
pub mod session;
pub mod storage;

pub use runtime::{Runtime, RuntimeError};
pub use services::SessionServices;
pub use session::{AppSession, AppSessionState, BackMsgError};
