use std::collections::HashMap;

use parking_lot::Mutex;

use crate::bridge::message::QueueKey;

#[derive(Debug, Clone, Copy, Default)]
struct ChatState {
    last_sender_id: Option<i64>,
}

/// Remembers who posted last on each lane so consecutive messages from the
/// same sender share one header. Each lane is only touched by its own worker.
#[derive(Debug, Default)]
pub struct ChatStateTracker {
    states: Mutex<HashMap<QueueKey, ChatState>>,
}

impl ChatStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sender_id` as the latest poster on `lane` and reports whether
    /// the message needs a sender header.
    pub fn observe_sender(&self, lane: &QueueKey, sender_id: i64) -> bool {
        let mut states = self.states.lock();
        let state = states.entry(*lane).or_default();
        let show_header = state.last_sender_id != Some(sender_id);
        state.last_sender_id = Some(sender_id);
        show_header
    }
}
