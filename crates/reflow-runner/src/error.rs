//! Runner errors.

use std::path::PathBuf;

use reflow_core::{RerunData, protocol::ExceptionInfo};
use thiserror::Error;

/// Ways a script run can end early.
///
/// `Stop` and `Rerun` are control flow: scripts propagate them with `?`
/// from any checkpoint and the runner turns them into lifecycle events.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script stopped")]
    Stop,
    #[error("Script interrupted for rerun")]
    Rerun(Box<RerunData>),
    #[error("{0}")]
    Exception(ExceptionInfo),
    #[error("Failed to load script {path}: {message}")]
    Compile { path: PathBuf, message: String },
}

impl ScriptError {
    /// An uncaught script exception.
    #[must_use]
    pub fn exception(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exception(ExceptionInfo::new(type_name, message))
    }

    /// Whether this error is stop/rerun control flow.
    #[must_use]
    pub const fn is_control_flow(&self) -> bool {
        matches!(self, Self::Stop | Self::Rerun(_))
    }

    /// The error as a displayable exception.
    #[must_use]
    pub fn to_exception_info(&self) -> ExceptionInfo {
        match self {
            Self::Exception(info) => info.clone(),
            Self::Compile { .. } => ExceptionInfo::new("CompileError", self.to_string()),
            Self::Stop | Self::Rerun(_) => ExceptionInfo::new("ControlFlow", self.to_string()),
        }
    }
}

impl From<anyhow::Error> for ScriptError {
    fn from(err: anyhow::Error) -> Self {
        let mut info = ExceptionInfo::new("Error", err.to_string());
        info.stack_trace = err.chain().skip(1).map(ToString::to_string).collect();
        Self::Exception(info)
    }
}

/// Runner error.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Failed to spawn script thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("Script runner already started")]
    AlreadyStarted,
}
