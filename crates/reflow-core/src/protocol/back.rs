//! Client-to-server envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackMsg {
    #[serde(flatten)]
    pub kind: BackMsgKind,
    /// Client-assigned id, echoed on forward messages for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_last_backmsg_id: Option<String>,
}

/// Back message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackMsgKind {
    /// Rerun the script (or one fragment) with the given client state.
    RerunScript(ClientState),
    /// Clear every cache and the widget state store.
    ClearCache,
    /// Toggle run-on-save.
    SetRunOnSave { value: bool },
    /// Stop the running script.
    StopScript,
    /// Ask for upload URLs.
    FileUrlsRequest(FileUrlsRequest),
    /// Keepalive.
    AppHeartbeat,
}

impl BackMsg {
    /// Create a message without a debug id.
    #[must_use]
    pub const fn new(kind: BackMsgKind) -> Self {
        Self {
            kind,
            debug_last_backmsg_id: None,
        }
    }

    /// Attach a debug id.
    #[must_use]
    pub fn with_debug_id(mut self, id: impl Into<String>) -> Self {
        self.debug_last_backmsg_id = Some(id.into());
        self
    }
}

/// Request for upload URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUrlsRequest {
    pub request_id: String,
    pub file_names: Vec<String>,
    pub session_id: String,
}

/// Last-seen UI state reported by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientState {
    pub query_string: String,
    pub widget_states: Option<WidgetStates>,
    pub page_script_hash: String,
    pub page_name: String,
    /// Set when only one fragment should rerun.
    pub fragment_id: Option<String>,
    pub is_auto_rerun: bool,
}

/// Widget values keyed by widget id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetStates {
    pub widgets: Vec<WidgetState>,
}

impl WidgetStates {
    /// Look up a widget's state by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&WidgetState> {
        self.widgets.iter().find(|w| w.id == id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty()
    }
}

impl FromIterator<WidgetState> for WidgetStates {
    fn from_iter<I: IntoIterator<Item = WidgetState>>(iter: I) -> Self {
        Self {
            widgets: iter.into_iter().collect(),
        }
    }
}

/// One widget's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetState {
    pub id: String,
    pub value: WidgetValue,
}

impl WidgetState {
    #[must_use]
    pub fn new(id: impl Into<String>, value: WidgetValue) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// Widget value variants.
///
/// Trigger values are set for exactly one run and then reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WidgetValue {
    /// A plain value held across runs.
    Json(Value),
    /// A button-like trigger.
    Trigger(bool),
    /// A trigger carrying a string payload (e.g. chat input).
    StringTrigger(Option<String>),
}

impl WidgetValue {
    /// Whether this is a trigger that fired and has not been consumed.
    #[must_use]
    pub const fn is_set_trigger(&self) -> bool {
        match self {
            Self::Json(_) => false,
            Self::Trigger(fired) => *fired,
            Self::StringTrigger(payload) => payload.is_some(),
        }
    }

    /// Whether both values are the same trigger kind.
    #[must_use]
    pub const fn same_trigger_kind(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (Self::Trigger(_), Self::Trigger(_)) | (Self::StringTrigger(_), Self::StringTrigger(_))
        )
    }

    /// The value a trigger falls back to after its run.
    #[must_use]
    pub fn reset(&self) -> Self {
        match self {
            Self::Json(v) => Self::Json(v.clone()),
            Self::Trigger(_) => Self::Trigger(false),
            Self::StringTrigger(_) => Self::StringTrigger(None),
        }
    }
}
