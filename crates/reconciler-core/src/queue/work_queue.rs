//! Deduplicating, delayable, rate-limited work queue.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::rate_limiter::{RateLimiter, default_controller_rate_limiter};
use super::state::QueueState;
use crate::domain::Key;
use crate::observability::QueueStats;

/// Upper bound for a single delay; longer requests are clamped to it.
const MAX_DELAY: Duration = Duration::from_secs(86400 * 365 * 30);

/// Backlog of keys waiting to be reconciled.
///
/// - `add` は dirty set に入れるだけ（重複は無視）
/// - `get` で取り出したキーは `done` されるまで他の worker に渡らない
/// - 処理中に `add` されたキーは `done` の後にもう一度 `get` で返る
///
/// The lock is never held across an `.await`.
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter: Box::new(rate_limiter),
        }
    }

    /// Queue backed by [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` dirty. No-op after shutdown or when the key is already dirty.
    pub fn add(&self, key: impl Into<Key>) {
        let key = key.into();
        let wake = {
            let mut state = self.lock();
            if state.is_shutting_down() {
                trace!(queue = %self.name, %key, "add after shutdown dropped");
                return;
            }
            state.insert(key)
        };
        if wake {
            self.notify.notify_one();
        }
    }

    /// Make `key` dirty once `delay` has elapsed.
    ///
    /// Pending delayed keys are dropped when the queue shuts down.
    pub fn add_after(&self, key: impl Into<Key>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let rescheduled = {
            let mut state = self.lock();
            if state.is_shutting_down() {
                return;
            }
            state.schedule(key, ready_at(Instant::now(), delay))
        };
        // waiting consumers have to recompute their wake-up deadline
        if rescheduled {
            self.notify.notify_one();
        }
    }

    /// Requeue `key` after the rate limiter's delay for it.
    pub fn add_rate_limited(&self, key: impl Into<Key>) {
        let key = key.into();
        if self.is_shutting_down() {
            return;
        }
        let delay = self.rate_limiter.when(&key);
        trace!(queue = %self.name, %key, ?delay, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue is shut down and nothing is left to hand
    /// out. The returned key must be passed to [`done`](Self::done).
    pub async fn get(&self) -> Option<Key> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before looking at the state so no wake-up is missed
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.lock();
                state.promote_delayed(Instant::now());

                if let Some(key) = state.pop() {
                    let more = state.has_queued();
                    drop(state);
                    // まだ残っていれば次の consumer を起こす
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }

                if state.is_shutting_down() {
                    return None;
                }

                state.next_ready_at()
            };

            match next_wake {
                Some(wake_at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(wake_at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing. If it was re-added meanwhile it becomes
    /// available to `get` again.
    pub fn done(&self, key: &Key) {
        let wake = self.lock().release(key);
        if wake {
            self.notify.notify_one();
        }
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &Key) {
        self.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &Key) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Stop accepting work and wake every waiting consumer.
    ///
    /// Keys already dirty are still handed out until drained.
    pub fn shut_down(&self) {
        self.lock().shut_down();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().is_shutting_down()
    }

    /// Number of dirty keys, including keys re-added while being processed.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        state.promote_delayed(Instant::now());
        state.dirty_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let mut state = self.lock();
        state.promote_delayed(Instant::now());
        QueueStats {
            dirty: state.dirty_len(),
            queued: state.queued_len(),
            processing: state.processing_len(),
            delayed: state.delayed_len(),
        }
    }
}

fn ready_at(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(MAX_DELAY))
        .or_else(|| now.checked_add(Duration::from_secs(86400)))
        .unwrap_or(now)
}
