//! Queue bookkeeping: dirty / processing / delayed sets behind one lock.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use tokio::time::Instant;

use crate::domain::Key;

/// Delayed entry for the min-heap.
///
/// Reverse ordering so BinaryHeap pops the earliest ready time first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delayed {
    ready_at: Instant,
    key: Key,
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// State of a [`WorkQueue`](super::WorkQueue).
///
/// Invariants:
/// - `queue` holds exactly the keys that are dirty and not processing.
/// - a key is in `processing` for at most one worker.
/// - `delayed_at` holds the live ready time per key; heap entries that do not
///   match it are stale and skipped.
#[derive(Debug, Default)]
pub(super) struct QueueState {
    queue: VecDeque<Key>,
    dirty: HashSet<Key>,
    processing: HashSet<Key>,
    delayed: BinaryHeap<Delayed>,
    delayed_at: HashMap<Key, Instant>,
    shutting_down: bool,
}

impl QueueState {
    /// Mark `key` dirty. Returns true when it became dispatchable.
    pub(super) fn insert(&mut self, key: Key) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        // 処理中なら done() の時点で queue に戻す
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Take the next dispatchable key and mark it processing.
    pub(super) fn pop(&mut self) -> Option<Key> {
        let key = self.queue.pop_front()?;
        self.dirty.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }

    /// Release `key`. Returns true when it was re-added meanwhile and is dispatchable again.
    pub(super) fn release(&mut self, key: &Key) -> bool {
        if !self.processing.remove(key) {
            return false;
        }
        if self.dirty.contains(key) {
            self.queue.push_back(key.clone());
            return true;
        }
        false
    }

    /// Schedule `key` to become dirty at `ready_at`; an earlier existing schedule wins.
    /// Returns true when the schedule changed.
    pub(super) fn schedule(&mut self, key: Key, ready_at: Instant) -> bool {
        if let Some(existing) = self.delayed_at.get(&key)
            && *existing <= ready_at
        {
            return false;
        }
        self.delayed_at.insert(key.clone(), ready_at);
        self.delayed.push(Delayed { ready_at, key });
        true
    }

    /// Move delayed keys whose time has come into the dirty set.
    /// Returns how many became dispatchable.
    pub(super) fn promote_delayed(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if self.delayed_at.get(&entry.key) != Some(&entry.ready_at) {
                continue; // stale
            }
            self.delayed_at.remove(&entry.key);
            if self.insert(entry.key) {
                promoted += 1;
            }
        }
        promoted
    }

    /// Earliest pending ready time, if any.
    pub(super) fn next_ready_at(&self) -> Option<Instant> {
        self.delayed.peek().map(|entry| entry.ready_at)
    }

    pub(super) fn shut_down(&mut self) {
        self.shutting_down = true;
        self.delayed.clear();
        self.delayed_at.clear();
    }

    pub(super) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub(super) fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    pub(super) fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub(super) fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub(super) fn processing_len(&self) -> usize {
        self.processing.len()
    }

    pub(super) fn delayed_len(&self) -> usize {
        self.delayed_at.len()
    }
}
