//! Ordered, deduplicating outbound message queue.

use std::collections::HashMap;

use crate::protocol::{Delta, ForwardMsg, ForwardMsgKind, ScriptFinishedStatus};

/// Outbound mailbox of forward messages for one session.
///
/// Messages leave in enqueue order. A delta whose path is already queued
/// may replace the queued delta in place instead of being appended.
#[derive(Debug, Default)]
pub struct ForwardMsgQueue {
    queue: Vec<ForwardMsg>,
    delta_index_map: HashMap<Vec<u32>, usize>,
}

impl ForwardMsgQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message, composing it onto a queued delta at the same path
    /// when possible.
    pub fn enqueue(&mut self, msg: ForwardMsg) {
        if let Some(delta) = msg.as_delta() {
            if !msg.metadata.delta_path.is_empty() {
                let delta_key = msg.metadata.delta_path.clone();
                if let Some(&index) = self.delta_index_map.get(&delta_key) {
                    if let Some(old_delta) = self.queue[index].as_delta() {
                        if can_replace(old_delta, delta) {
                            self.queue[index] = msg;
                            return;
                        }
                    }
                }
                self.delta_index_map.insert(delta_key, self.queue.len());
            }
        }
        self.queue.push(msg);
    }

    /// Drop queued messages.
    ///
    /// With `retain_lifecycle_msgs`, lifecycle messages survive. When
    /// `fragment_ids_this_run` is given, a retained successful
    /// script-finished message is rewritten as a fragment-run finish.
    pub fn clear(&mut self, retain_lifecycle_msgs: bool, fragment_ids_this_run: Option<&[String]>) {
        self.delta_index_map.clear();
        if !retain_lifecycle_msgs {
            self.queue.clear();
            return;
        }

        let is_fragment_run = fragment_ids_this_run.is_some();
        self.queue.retain(ForwardMsg::is_lifecycle);
        if is_fragment_run {
            for msg in &mut self.queue {
                if let ForwardMsgKind::ScriptFinished { status } = &mut msg.kind {
                    if *status == ScriptFinishedStatus::FinishedSuccessfully {
                        *status = ScriptFinishedStatus::FinishedFragmentRunSuccessfully;
                    }
                }
            }
        }
    }

    /// Take every queued message, in order.
    pub fn flush(&mut self) -> Vec<ForwardMsg> {
        self.delta_index_map.clear();
        std::mem::take(&mut self.queue)
    }

    /// Queued messages, in order.
    #[must_use]
    pub fn messages(&self) -> &[ForwardMsg] {
        &self.queue
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Whether `new` may replace `old` at the same delta path.
///
/// Blocks are never replaced because later deltas may live inside them.
const fn can_replace(old: &Delta, new: &Delta) -> bool {
    if old.is_add_block() {
        return false;
    }
    new.is_new_element() || new.is_add_block()
}
