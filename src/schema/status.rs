use serde::{Deserialize, Serialize};

/// Snapshot of the queue's task accounting, taken under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Requests currently executing on the worker (0 or 1).
    pub active: usize,
    /// Requests waiting in the queue.
    pub queued: usize,
}

impl QueueStatus {
    /// Outstanding work: what a "N tasks in flight" badge shows.
    pub fn total(&self) -> usize {
        self.active + self.queued
    }

    pub fn is_idle(&self) -> bool {
        self.total() == 0
    }
}
