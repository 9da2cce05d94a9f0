//! Outcome model: what a reconcile asks the engine to do next with its key.

use std::time::Duration;

/// Result of one successful reconcile.
///
/// Failures are reported as `Err(ReconcileError)` instead; the engine requeues
/// those with rate-limited backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Outcome {
    /// Converged. The key's backoff counter is reset.
    #[default]
    Done,

    /// Run again after the given delay (periodic resync, waiting on something external).
    RequeueAfter(Duration),

    /// Run again with rate-limited backoff, without reporting an error.
    Requeue,
}

impl Outcome {
    pub fn requeue_after(delay: Duration) -> Self {
        if delay.is_zero() {
            Outcome::Done
        } else {
            Outcome::RequeueAfter(delay)
        }
    }

    /// Does this outcome schedule another run of the same key?
    pub fn is_requeue(self) -> bool {
        !matches!(self, Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delay_is_done() {
        assert_eq!(Outcome::requeue_after(Duration::ZERO), Outcome::Done);
        assert!(!Outcome::requeue_after(Duration::ZERO).is_requeue());
    }

    #[test]
    fn nonzero_delay_requeues() {
        let outcome = Outcome::requeue_after(Duration::from_secs(30));
        assert_eq!(outcome, Outcome::RequeueAfter(Duration::from_secs(30)));
        assert!(outcome.is_requeue());
        assert!(Outcome::Requeue.is_requeue());
    }
}
