//! Snapshots for logs and status output.

use serde::{Deserialize, Serialize};

/// Point-in-time view of a [`WorkQueue`](crate::queue::WorkQueue).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Keys waiting for a worker, including keys re-added while processing.
    pub dirty: usize,
    /// Dirty keys that can be handed out right now.
    pub queued: usize,
    /// Keys checked out by a worker.
    pub processing: usize,
    /// Keys scheduled for later.
    pub delayed: usize,
}

impl QueueStats {
    /// Nothing waiting and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.dirty == 0 && self.processing == 0
    }
}
