//! Controller: waits for the initial sync, runs the worker pool, drains on shutdown.
//!
//! # Lifecycle
//! `Initializing → WaitingForSync → Running → Draining → Stopped`
//!
//! - WaitingForSync: every registered sync check must pass before workers
//!   start. Timing out (or being cancelled) here is fatal to `run`.
//! - Draining: the queue is shut down; already dirty and in-flight keys are
//!   processed until the queue is empty and no worker is left.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::queue::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter, WorkQueue,
};
use crate::reconciler::Reconciler;
use crate::source::SyncCheck;
use crate::worker::WorkerPool;

/// How often sync checks are re-evaluated while waiting for the initial listing.
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerState {
    Initializing,
    WaitingForSync,
    Running,
    Draining,
    Stopped,
}

pub struct Controller {
    name: Arc<str>,
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
    sync_checks: Vec<SyncCheck>,
    state: watch::Sender<ControllerState>,
    /// Published by the worker-count aggregator; nobody else writes it.
    running_workers: Arc<watch::Sender<usize>>,
    started: AtomicBool,
}

impl Controller {
    /// Build a controller whose queue uses the backoff settings from `config`.
    pub fn new(
        name: impl Into<String>,
        config: ControllerConfig,
        reconciler: impl Reconciler + 'static,
    ) -> Result<Self, ControllerError> {
        let rate_limiter = rate_limiter_for(&config);
        Self::with_rate_limiter(name, config, reconciler, rate_limiter)
    }

    pub fn with_rate_limiter(
        name: impl Into<String>,
        config: ControllerConfig,
        reconciler: impl Reconciler + 'static,
        rate_limiter: impl RateLimiter + 'static,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let name: String = name.into();
        if name.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "controller name must not be empty".to_string(),
            ));
        }

        let queue = Arc::new(WorkQueue::new(name.clone(), rate_limiter));
        let (state, _) = watch::channel(ControllerState::Initializing);
        let (running_workers, _) = watch::channel(0);

        Ok(Self {
            name: Arc::from(name),
            config,
            queue,
            reconciler: Arc::new(reconciler),
            sync_checks: Vec::new(),
            state,
            running_workers: Arc::new(running_workers),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Queue handle for event handlers.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Register a readiness predicate ("initial listing complete?").
    pub fn add_sync_check(&mut self, check: impl Fn() -> bool + Send + Sync + 'static) {
        self.sync_checks.push(Arc::new(check));
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    pub fn running_workers(&self) -> usize {
        *self.running_workers.borrow()
    }

    fn set_state(&self, next: ControllerState) {
        let prev = self.state.send_replace(next);
        debug!(controller = %self.name, from = ?prev, to = ?next, "state_transition");
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped), then drain.
    ///
    /// # Errors
    /// - [`ControllerError::SyncTimeout`] if the sync checks do not pass within
    ///   `sync_timeout`, or shutdown is requested first. No worker is started.
    /// - [`ControllerError::AlreadyStarted`] on a second call.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ControllerError::AlreadyStarted(self.name.to_string()));
        }

        self.set_state(ControllerState::WaitingForSync);
        if let Err(err) = self.wait_for_sync(&mut shutdown).await {
            error!(controller = %self.name, error = %err, "timed out waiting for caches to sync");
            self.queue.shut_down();
            self.set_state(ControllerState::Stopped);
            return Err(err);
        }

        // 稼働中ワーカー数はこのタスクだけが書き換える
        let (liveness_tx, liveness_rx) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(count_running_workers(
            liveness_rx,
            Arc::clone(&self.running_workers),
        ));

        info!(
            controller = %self.name,
            workers = self.config.concurrent_syncs,
            "controller initialized"
        );
        self.set_state(ControllerState::Running);

        let pool = WorkerPool::spawn(
            self.config.concurrent_syncs,
            Arc::clone(&self.name),
            Arc::clone(&self.queue),
            Arc::clone(&self.reconciler),
            liveness_tx,
        );

        wait_for_shutdown(&mut shutdown).await;

        self.set_state(ControllerState::Draining);
        self.queue.shut_down();
        self.drain().await;

        pool.join().await;
        // all liveness senders are gone once the workers have exited
        let _ = aggregator.await;

        self.set_state(ControllerState::Stopped);
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }

    async fn wait_for_sync(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), ControllerError> {
        let started = Instant::now();
        let deadline = started + self.config.sync_timeout();
        let timed_out = || ControllerError::SyncTimeout {
            controller: self.name.to_string(),
            waited: started.elapsed(),
        };

        loop {
            if self.sync_checks.iter().all(|check| check()) {
                debug!(controller = %self.name, waited = ?started.elapsed(), "caches synced");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }

            tokio::select! {
                _ = tokio::time::sleep(SYNC_POLL_INTERVAL.min(deadline - now)) => {}
                _ = wait_for_shutdown(shutdown) => return Err(timed_out()),
            }
        }
    }

    /// Wait until the queue is empty and no worker is running.
    ///
    /// Re-checks every `drain_poll_interval`, or sooner when a worker exits.
    async fn drain(&self) {
        let interval = self.config.drain_poll_interval();
        let mut running_rx = self.running_workers.subscribe();

        loop {
            let queue_length = self.queue.len();
            let running = *running_rx.borrow_and_update();
            if queue_length == 0 && running == 0 {
                debug!(
                    controller = %self.name,
                    "no running workers and no items left in the queue, terminating"
                );
                return;
            }
            debug!(
                controller = %self.name,
                queue_length,
                running_workers = running,
                "waiting for workers to finish"
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = running_rx.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }
}

/// Per-key exponential backoff plus the overall retry bucket, from `config`.
fn rate_limiter_for(config: &ControllerConfig) -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            config.backoff_base(),
            config.backoff_max(),
        )),
        Box::new(BucketRateLimiter::new(config.bucket_qps, config.bucket_burst)),
    ])
}

/// Resolves once shutdown is requested or the sender is dropped.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // sender dropped: nobody can ask us to keep running anymore
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Owns the running-worker count; workers only ever send `+1` / `-1`.
async fn count_running_workers(
    mut liveness: mpsc::UnboundedReceiver<isize>,
    published: Arc<watch::Sender<usize>>,
) {
    let mut number_of_running_workers: isize = 0;
    while let Some(delta) = liveness.recv().await {
        number_of_running_workers += delta;
        published.send_replace(usize::try_from(number_of_running_workers).unwrap_or(0));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::domain::{Key, Outcome};
    use crate::error::ReconcileError;
    use crate::reconciler::reconciler_fn;

    fn noop() -> impl Reconciler + 'static {
        reconciler_fn(|_key: Key| async move {
            let result: Result<Outcome, ReconcileError> = Ok(Outcome::Done);
            result
        })
    }

    fn config(workers: usize) -> ControllerConfig {
        ControllerConfig {
            concurrent_syncs: workers,
            sync_timeout_ms: 1_000,
            drain_poll_interval_ms: 5_000,
            ..Default::default()
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result = Controller::new("event", config(0), noop());
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn empty_name_is_rejected() {
        let result = Controller::new("", config(1), noop());
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn new_controller_is_initializing() {
        let controller = Controller::new("event", config(2), noop()).unwrap();
        assert_eq!(controller.state(), ControllerState::Initializing);
        assert_eq!(controller.name(), "event");
        assert_eq!(controller.queue().name(), "event");
        assert_eq!(controller.running_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_timeout_stops_before_workers_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reconciler = reconciler_fn({
            let calls = Arc::clone(&calls);
            move |_key: Key| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let result: Result<Outcome, ReconcileError> = Ok(Outcome::Done);
                    result
                }
            }
        });
        let mut controller = Controller::new("event", config(2), reconciler).unwrap();
        controller.add_sync_check(|| false);
        controller.queue().add("ns/a");

        let (_tx, rx) = watch::channel(false);
        let err = controller.run(rx).await.unwrap_err();

        match err {
            ControllerError::SyncTimeout {
                controller: name,
                waited,
            } => {
                assert_eq!(name, "event");
                assert!(waited >= Duration::from_secs(1));
            }
            other => panic!("expected SyncTimeout, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert_eq!(controller.running_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_sync_wait_is_fatal() {
        let mut controller = Controller::new("event", config(1), noop()).unwrap();
        controller.add_sync_check(|| false);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = controller.run(rx).await;
        assert!(matches!(result, Err(ControllerError::SyncTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_checks_are_polled_until_ready() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut controller = Controller::new("event", config(1), noop()).unwrap();
        controller.add_sync_check({
            let polls = Arc::clone(&polls);
            move || polls.fetch_add(1, Ordering::SeqCst) >= 3
        });
        let controller = Arc::new(controller);

        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let controller = Arc::clone(&controller);
            async move { controller.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.state(), ControllerState::Running);
        assert_eq!(controller.running_workers(), 1);

        tx.send(true).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(polls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let controller = Controller::new("event", config(1), noop()).unwrap();

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        controller.run(rx.clone()).await.unwrap();

        let second = controller.run(rx).await;
        assert!(matches!(second, Err(ControllerError::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_stops_controller() {
        let controller = Controller::new("event", config(2), noop()).unwrap();
        let (tx, rx) = watch::channel(false);
        drop(tx);

        controller.run(rx).await.unwrap();
        assert_eq!(controller.state(), ControllerState::Stopped);
    }
}
