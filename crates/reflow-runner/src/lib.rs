//! Script execution for rerun sessions.
//!
//! Provides:
//! - `ScriptRunner` - Runs a script on its own thread with cooperative stop/rerun
//! - `ScriptRequests` - The stop/rerun request state machine
//! - `ScriptRunContext` - What a running script sees
//! - `ScriptCache` / `FragmentStorage` - Loaded scripts and registered fragments

pub mod context;
pub mod error;
pub mod event;
pub mod fragment;
pub mod requests;
pub mod runner;
pub mod script;

pub use context::ScriptRunContext;
pub use error::{RunnerError, ScriptError};
pub use event::ScriptRunnerEvent;
pub use fragment::{Fragment, FragmentStorage, MemoryFragmentStorage};
pub use requests::{ScriptRequest, ScriptRequests};
pub use runner::{
    EventListener, ScriptRunner, ScriptRunnerControl, ScriptRunnerFactory, ScriptRunnerParams,
    ThreadedRunnerFactory,
};
pub use script::{Script, ScriptCache, ScriptLoader, ScriptRegistry};
