//! Server-to-client envelopes.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{UserInfo, config::ThemeConfig};

/// Delta path of the main container's first slot.
///
/// Exceptions raised outside a script run are rendered there.
pub const MAIN_ROOT_DELTA_PATH: [u32; 2] = [0, 0];

/// Message metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMsgMetadata {
    /// Position of a delta in the element tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delta_path: Vec<u32>,
    /// Whether the client may cache this message.
    #[serde(default)]
    pub cacheable: bool,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMsg {
    #[serde(default)]
    pub metadata: ForwardMsgMetadata,
    /// Id of the last back message the session saw before enqueueing this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_last_backmsg_id: Option<String>,
    #[serde(flatten)]
    pub kind: ForwardMsgKind,
}

/// Forward message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForwardMsgKind {
    /// A script run started; describes the session and its pages.
    NewSession(Box<NewSession>),
    /// An incremental UI change.
    Delta(Delta),
    /// A script run ended.
    ScriptFinished { status: ScriptFinishedStatus },
    /// Run-on-save or running state changed.
    SessionStatusChanged(SessionStatus),
    /// Out-of-band session notification.
    SessionEvent { event: SessionEventKind },
    /// An error to render in the app.
    Exception(ExceptionInfo),
    /// The set of pages changed.
    PagesChanged { app_pages: Vec<AppPage> },
    /// The requested page does not exist.
    PageNotFound { page_name: String },
    /// Upload URLs for a file URLs request.
    FileUrlsResponse(FileUrlsResponse),
}

impl ForwardMsg {
    /// Create a message with empty metadata.
    #[must_use]
    pub fn new(kind: ForwardMsgKind) -> Self {
        Self {
            metadata: ForwardMsgMetadata::default(),
            debug_last_backmsg_id: None,
            kind,
        }
    }

    /// Create a delta message at the given path.
    #[must_use]
    pub fn delta(delta_path: Vec<u32>, delta: Delta) -> Self {
        Self {
            metadata: ForwardMsgMetadata {
                delta_path,
                cacheable: false,
            },
            debug_last_backmsg_id: None,
            kind: ForwardMsgKind::Delta(delta),
        }
    }

    /// Create a script-finished message.
    #[must_use]
    pub fn script_finished(status: ScriptFinishedStatus) -> Self {
        Self::new(ForwardMsgKind::ScriptFinished { status })
    }

    /// Create an exception message rendered at the top of the main container.
    #[must_use]
    pub fn exception(info: ExceptionInfo) -> Self {
        let mut msg = Self::new(ForwardMsgKind::Exception(info));
        msg.metadata.delta_path = MAIN_ROOT_DELTA_PATH.to_vec();
        msg
    }

    /// Create a session event message.
    #[must_use]
    pub fn session_event(event: SessionEventKind) -> Self {
        Self::new(ForwardMsgKind::SessionEvent { event })
    }

    /// Whether this message must survive a queue clear.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self.kind,
            ForwardMsgKind::NewSession(_)
                | ForwardMsgKind::ScriptFinished { .. }
                | ForwardMsgKind::SessionStatusChanged(_)
        )
    }

    /// Short name of the payload, for logging.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self.kind {
            ForwardMsgKind::NewSession(_) => "new_session",
            ForwardMsgKind::Delta(_) => "delta",
            ForwardMsgKind::ScriptFinished { .. } => "script_finished",
            ForwardMsgKind::SessionStatusChanged(_) => "session_status_changed",
            ForwardMsgKind::SessionEvent { .. } => "session_event",
            ForwardMsgKind::Exception(_) => "exception",
            ForwardMsgKind::PagesChanged { .. } => "pages_changed",
            ForwardMsgKind::PageNotFound { .. } => "page_not_found",
            ForwardMsgKind::FileUrlsResponse(_) => "file_urls_response",
        }
    }

    /// The delta payload, if this is a delta message.
    #[must_use]
    pub const fn as_delta(&self) -> Option<&Delta> {
        match &self.kind {
            ForwardMsgKind::Delta(delta) => Some(delta),
            _ => None,
        }
    }
}

/// An incremental UI change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    /// Fragment that produced this delta, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
}

/// Delta payloads. Element contents are opaque to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    NewElement(Value),
    AddBlock(Value),
    AddRows(Value),
}

impl Delta {
    /// A new element delta.
    #[must_use]
    pub const fn new_element(element: Value) -> Self {
        Self {
            kind: DeltaKind::NewElement(element),
            fragment_id: None,
        }
    }

    /// A new block delta.
    #[must_use]
    pub const fn add_block(block: Value) -> Self {
        Self {
            kind: DeltaKind::AddBlock(block),
            fragment_id: None,
        }
    }

    /// Tag this delta with the fragment that produced it.
    #[must_use]
    pub fn in_fragment(mut self, fragment_id: impl Into<String>) -> Self {
        self.fragment_id = Some(fragment_id.into());
        self
    }

    #[must_use]
    pub const fn is_add_block(&self) -> bool {
        matches!(self.kind, DeltaKind::AddBlock(_))
    }

    #[must_use]
    pub const fn is_new_element(&self) -> bool {
        matches!(self.kind, DeltaKind::NewElement(_))
    }
}

/// Why a script run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFinishedStatus {
    FinishedSuccessfully,
    FinishedWithCompileError,
    FinishedEarlyForRerun,
    FinishedFragmentRunSuccessfully,
}

/// Session run state as seen by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub run_on_save: bool,
    pub script_is_running: bool,
}

/// Out-of-band session notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    ScriptChangedOnDisk,
    ScriptCompilationException(ExceptionInfo),
}

/// A displayable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
    #[serde(default)]
    pub is_warning: bool,
}

impl ExceptionInfo {
    /// Create an exception with no stack trace.
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: Vec::new(),
            is_warning: false,
        }
    }

    /// Build from an error, recording its source chain as the stack trace.
    #[must_use]
    pub fn from_error(type_name: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack_trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack_trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            type_name: type_name.into(),
            message: err.to_string(),
            stack_trace,
            is_warning: false,
        }
    }
}

impl fmt::Display for ExceptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// A page entry as sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPage {
    pub page_script_hash: String,
    pub page_name: String,
    pub icon: String,
    pub url_pathname: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Session-wide settings the client needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSessionConfig {
    pub allow_run_on_save: bool,
    pub max_cached_message_age: u32,
}

/// Per-connection initialization data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Initialize {
    pub user_info: UserInfo,
    pub session_id: String,
    pub session_status: SessionStatus,
    pub runtime_version: String,
    pub os: String,
}

/// Announces a script run and the session it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub script_run_id: String,
    pub name: String,
    pub main_script_path: String,
    pub main_script_hash: String,
    pub page_script_hash: String,
    #[serde(default)]
    pub fragment_ids_this_run: Vec<String>,
    #[serde(default)]
    pub app_pages: Vec<AppPage>,
    pub config: NewSessionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_theme: Option<ThemeConfig>,
    pub initialize: Initialize,
}

/// Upload and delete URLs for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUrls {
    pub file_id: String,
    pub upload_url: String,
    pub delete_url: String,
}

/// Response to a file URLs request, keyed by the request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUrlsResponse {
    pub response_id: String,
    pub file_urls: Vec<FileUrls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}
