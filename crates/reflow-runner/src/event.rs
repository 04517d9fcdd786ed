//! Events a script runner reports to its session.

use reflow_core::{ClientState, ForwardMsg, PageHash, protocol::ExceptionInfo};

/// Script runner lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRunnerEvent {
    /// A run began.
    ScriptStarted {
        page_script_hash: PageHash,
        /// Set for fragment runs.
        fragment_ids_this_run: Option<Vec<String>>,
    },
    /// A full run ended, successfully or by a stop request.
    ScriptStoppedWithSuccess,
    /// The script could not be loaded.
    ScriptStoppedWithCompileError { error: ExceptionInfo },
    /// The run was interrupted and a rerun follows immediately.
    ScriptStoppedForRerun,
    /// A fragment run ended.
    FragmentStoppedWithSuccess,
    /// The runner thread is exiting. Carries the final client state.
    Shutdown { client_state: ClientState },
    /// The script produced a message for the client.
    EnqueueForwardMsg(ForwardMsg),
}

impl ScriptRunnerEvent {
    /// Short name of the event, for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ScriptStarted { .. } => "SCRIPT_STARTED",
            Self::ScriptStoppedWithSuccess => "SCRIPT_STOPPED_WITH_SUCCESS",
            Self::ScriptStoppedWithCompileError { .. } => "SCRIPT_STOPPED_WITH_COMPILE_ERROR",
            Self::ScriptStoppedForRerun => "SCRIPT_STOPPED_FOR_RERUN",
            Self::FragmentStoppedWithSuccess => "FRAGMENT_STOPPED_WITH_SUCCESS",
            Self::Shutdown { .. } => "SHUTDOWN",
            Self::EnqueueForwardMsg(_) => "ENQUEUE_FORWARD_MSG",
        }
    }
}
