//! Per-session widget value store.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::protocol::{WidgetState, WidgetStates, WidgetValue};

/// Widget values and user-set keys for one session.
///
/// Written by the running script's thread, read by the session's event
/// loop. Shared as [`SharedSessionState`].
#[derive(Debug, Default)]
pub struct SessionState {
    widgets: HashMap<String, WidgetValue>,
    user_values: HashMap<String, Value>,
}

/// Handle to a session's widget state shared with its script runner.
pub type SharedSessionState = Arc<Mutex<SessionState>>;

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new shared store.
    #[must_use]
    pub fn shared() -> SharedSessionState {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Apply the client's widget values ahead of a run.
    pub fn on_script_will_rerun(&mut self, states: &WidgetStates) {
        for state in &states.widgets {
            self.widgets.insert(state.id.clone(), state.value.clone());
        }
    }

    /// Finish a full run: forget widgets that the run did not touch and
    /// reset triggers so they fire only once.
    pub fn on_script_finished(&mut self, widget_ids_this_run: &HashSet<String>) {
        self.widgets.retain(|id, _| widget_ids_this_run.contains(id));
        self.reset_triggers();
    }

    /// Reset fired triggers without dropping any values.
    pub fn reset_triggers(&mut self) {
        for value in self.widgets.values_mut() {
            if value.is_set_trigger() {
                *value = value.reset();
            }
        }
    }

    /// A widget's current value.
    #[must_use]
    pub fn widget_value(&self, id: &str) -> Option<&WidgetValue> {
        self.widgets.get(id)
    }

    /// Snapshot of every widget value, sorted by id.
    #[must_use]
    pub fn get_widget_states(&self) -> WidgetStates {
        let mut widgets: Vec<WidgetState> = self
            .widgets
            .iter()
            .map(|(id, value)| WidgetState::new(id.clone(), value.clone()))
            .collect();
        widgets.sort_by(|a, b| a.id.cmp(&b.id));
        widgets.into_iter().collect()
    }

    /// A user-set value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.user_values.get(key)
    }

    /// Set a user value.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.user_values.insert(key.into(), value);
    }

    /// Drop every widget and user value.
    pub fn clear(&mut self) {
        self.widgets.clear();
        self.user_values.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.widgets.is_empty() && self.user_values.is_empty()
    }
}
