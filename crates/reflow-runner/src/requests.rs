//! Stop and rerun requests shared between a session and its runner.

use std::sync::{Mutex, PoisonError};

use reflow_core::{RerunData, coalesce_widget_states};

/// What the runner should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRequest {
    Rerun(RerunData),
    Stop,
}

#[derive(Debug)]
enum RequestState {
    /// Keep running the current script.
    Continue,
    /// A rerun is pending.
    Rerun(RerunData),
    /// The runner is shutting down and accepts nothing more.
    Stop,
}

/// Request mailbox of one script runner.
///
/// The session writes requests from its event loop; the runner thread reads
/// them at checkpoints and between runs.
#[derive(Debug)]
pub struct ScriptRequests {
    state: Mutex<RequestState>,
}

impl Default for ScriptRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRequests {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RequestState::Continue),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the runner to stop. Idempotent.
    pub fn request_stop(&self) {
        *self.lock() = RequestState::Stop;
    }

    /// Ask the runner to rerun.
    ///
    /// Returns `false` once the runner is stopping; the caller then needs a
    /// new runner. A rerun arriving while another is pending is merged into
    /// it.
    pub fn request_rerun(&self, new_data: RerunData) -> bool {
        let mut state = self.lock();
        let next = match std::mem::replace(&mut *state, RequestState::Stop) {
            RequestState::Stop => return false,
            RequestState::Continue => new_data,
            RequestState::Rerun(pending) => coalesce_rerun_data(&pending, new_data),
        };
        *state = RequestState::Rerun(next);
        true
    }

    /// Called by the runner at a checkpoint.
    ///
    /// Returns a request if the running script must be interrupted. A
    /// pending fragment rerun that is not fragment-scoped waits until the
    /// script finishes.
    pub fn on_scriptrunner_yield(&self) -> Option<ScriptRequest> {
        let mut state = self.lock();
        let preempt = match &*state {
            RequestState::Continue => false,
            RequestState::Stop => return Some(ScriptRequest::Stop),
            RequestState::Rerun(data) => !fragment_run_should_not_preempt_script(data),
        };
        if !preempt {
            return None;
        }
        match std::mem::replace(&mut *state, RequestState::Continue) {
            RequestState::Rerun(data) => Some(ScriptRequest::Rerun(data)),
            other => {
                *state = other;
                None
            }
        }
    }

    /// Called by the runner when it is ready for its next run.
    ///
    /// Takes a pending rerun, or moves to `Stop` so no later rerun can be
    /// accepted.
    pub fn on_scriptrunner_ready(&self) -> ScriptRequest {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, RequestState::Stop) {
            RequestState::Rerun(data) => {
                *state = RequestState::Continue;
                ScriptRequest::Rerun(data)
            }
            RequestState::Continue | RequestState::Stop => ScriptRequest::Stop,
        }
    }

    /// Whether the runner has accepted a stop.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        matches!(*self.lock(), RequestState::Stop)
    }
}

fn fragment_run_should_not_preempt_script(data: &RerunData) -> bool {
    data.is_fragment_run() && !data.is_fragment_scoped_rerun
}

/// Merge a newly requested rerun into a pending one.
///
/// Full reruns always win over fragment reruns: a pending full rerun
/// absorbs a fragment request, and a new full rerun drops queued fragments.
fn coalesce_rerun_data(pending: &RerunData, new_data: RerunData) -> RerunData {
    let widget_states =
        coalesce_widget_states(pending.widget_states.as_ref(), new_data.widget_states.as_ref());

    let fragment_id_queue = match new_data.fragment_id() {
        Some(_) if !pending.is_fragment_run() => Vec::new(),
        Some(_) => {
            let mut queue = pending.fragment_id_queue.clone();
            for id in new_data.fragment_id_queue {
                if !queue.contains(&id) {
                    queue.push(id);
                }
            }
            queue
        }
        None => Vec::new(),
    };

    RerunData {
        query_string: new_data.query_string,
        widget_states,
        page_script_hash: new_data.page_script_hash,
        page_name: new_data.page_name,
        is_fragment_scoped_rerun: !fragment_id_queue.is_empty() && new_data.is_fragment_scoped_rerun,
        fragment_id_queue,
        is_auto_rerun: new_data.is_auto_rerun,
    }
}
