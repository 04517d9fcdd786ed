//! Rerun intent.

use std::collections::HashMap;

use crate::protocol::{ClientState, WidgetState, WidgetStates};

/// Why and what to (re)run.
///
/// The default value is a full-script rerun with no client state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RerunData {
    pub query_string: String,
    /// Widget values to apply before the run.
    pub widget_states: Option<WidgetStates>,
    /// Page to run; empty means "resolve by name or use the current page".
    pub page_script_hash: String,
    pub page_name: Option<String>,
    /// Fragments to run, in order. Empty for a full-script run.
    pub fragment_id_queue: Vec<String>,
    /// Whether the run only rewrites the fragments' own containers.
    pub is_fragment_scoped_rerun: bool,
    /// Whether the rerun was triggered without user input.
    pub is_auto_rerun: bool,
}

impl RerunData {
    /// Build rerun data from a client's rerun request.
    #[must_use]
    pub fn from_client_state(client_state: &ClientState) -> Self {
        let fragment_id_queue: Vec<String> = client_state.fragment_id.iter().cloned().collect();
        Self {
            query_string: client_state.query_string.clone(),
            widget_states: client_state.widget_states.clone(),
            page_script_hash: client_state.page_script_hash.clone(),
            page_name: (!client_state.page_name.is_empty()).then(|| client_state.page_name.clone()),
            is_fragment_scoped_rerun: !fragment_id_queue.is_empty(),
            fragment_id_queue,
            is_auto_rerun: client_state.is_auto_rerun,
        }
    }

    /// Whether this reruns one or more fragments rather than the whole script.
    #[must_use]
    pub fn is_fragment_run(&self) -> bool {
        !self.fragment_id_queue.is_empty()
    }

    /// The fragment this request targets, if it is a single-fragment run.
    #[must_use]
    pub fn fragment_id(&self) -> Option<&str> {
        self.fragment_id_queue.first().map(String::as_str)
    }
}

/// Merge a pending widget snapshot with a newer one.
///
/// Values from `new` win, except that a trigger which fired in `old` and
/// was never consumed keeps its fired value when `new` reports the same
/// trigger unset. Widgets only present in `old` are dropped.
#[must_use]
pub fn coalesce_widget_states(
    old: Option<&WidgetStates>,
    new: Option<&WidgetStates>,
) -> Option<WidgetStates> {
    let (old, new) = match (old, new) {
        (None, None) => return None,
        (Some(old), None) => return Some(old.clone()),
        (None, Some(new)) => return Some(new.clone()),
        (Some(old), Some(new)) => (old, new),
    };

    let fired: HashMap<&str, &WidgetState> = old
        .widgets
        .iter()
        .filter(|w| w.value.is_set_trigger())
        .map(|w| (w.id.as_str(), w))
        .collect();

    Some(
        new.widgets
            .iter()
            .map(|w| match fired.get(w.id.as_str()) {
                Some(old_w) if old_w.value.same_trigger_kind(&w.value) && !w.value.is_set_trigger() => {
                    (*old_w).clone()
                }
                _ => w.clone(),
            })
            .collect(),
    )
}
