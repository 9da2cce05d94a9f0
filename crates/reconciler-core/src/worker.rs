use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, warn};

use crate::domain::{Key, Outcome};
use crate::error::ReconcileError;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;

/// Worker pool handle.
/// - ワーカーは `queue.get()` が `None` を返すと自分で終了する（queue の shut_down が停止の合図）
/// - `join()` で全ワーカーの終了を待てる
pub struct WorkerPool {
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `n` workers.
    ///
    /// Each worker sends `+1` on `liveness` when it starts and `-1` when it exits.
    pub fn spawn(
        n: usize,
        controller: Arc<str>,
        queue: Arc<WorkQueue>,
        reconciler: Arc<dyn Reconciler>,
        liveness: mpsc::UnboundedSender<isize>,
    ) -> Self {
        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker = Worker {
                id: worker_id,
                controller: Arc::clone(&controller),
                queue: Arc::clone(&queue),
                reconciler: Arc::clone(&reconciler),
            };
            let liveness = liveness.clone();

            let join = tokio::spawn(async move {
                let _alive = Liveness::start(liveness);
                worker.run().await;
            });
            joins.push(join);
        }

        Self { joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for j in self.joins {
            if let Err(e) = j.await {
                warn!("worker task ended abnormally: {e}");
            }
        }
    }
}

/// Reports `+1` on creation and `-1` on drop, so an exiting worker is counted
/// even when it unwinds.
struct Liveness {
    tx: mpsc::UnboundedSender<isize>,
}

impl Liveness {
    fn start(tx: mpsc::UnboundedSender<isize>) -> Self {
        // ignore send error: the aggregator may already be gone
        let _ = tx.send(1);
        Self { tx }
    }
}

impl Drop for Liveness {
    fn drop(&mut self) {
        let _ = self.tx.send(-1);
    }
}

/// Aborts the reconcile task when the worker stops waiting for it, so the
/// task never outlives the `done` of its key.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Calls `done` for a checked-out key on every exit path.
struct InFlight<'a> {
    queue: &'a WorkQueue,
    key: Key,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

struct Worker {
    id: usize,
    controller: Arc<str>,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
}

impl Worker {
    async fn run(self) {
        debug!(controller = %self.controller, worker = self.id, "worker started");

        while let Some(key) = self.queue.get().await {
            let in_flight = InFlight {
                queue: &self.queue,
                key,
            };
            self.process(&in_flight.key).await;
        }

        debug!(controller = %self.controller, worker = self.id, "worker stopped");
    }

    async fn process(&self, key: &Key) {
        let span = tracing::debug_span!(
            "reconcile",
            controller = %self.controller,
            worker = self.id,
            key = %key,
        );

        // 別タスクで実行して panic をこのキーの失敗として扱う（worker は生き残る）
        let mut task = AbortOnDrop(tokio::spawn({
            let reconciler = Arc::clone(&self.reconciler);
            let key = key.clone();
            async move { reconciler.reconcile(&key).await }.instrument(span)
        }));
        let result: Result<Outcome, ReconcileError> = match (&mut task.0).await {
            Ok(result) => result,
            Err(join_error) => Err(format!("reconcile task failed: {join_error}").into()),
        };

        match result {
            Ok(Outcome::Done) => self.queue.forget(key),
            Ok(Outcome::RequeueAfter(delay)) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), delay);
            }
            Ok(Outcome::Requeue) => self.queue.add_rate_limited(key.clone()),
            Err(err) => {
                error!(
                    controller = %self.controller,
                    worker = self.id,
                    %key,
                    requeues = self.queue.num_requeues(key),
                    error = %err,
                    "reconcile failed, requeueing with backoff"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::queue::ItemExponentialFailureRateLimiter;
    use crate::reconciler::reconciler_fn;

    fn queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(10),
                Duration::from_secs(1),
            ),
        ))
    }

    /// Records every call; fails the first `failures` calls per run.
    struct Recording {
        calls: Mutex<Vec<Key>>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl Reconciler for Recording {
        async fn reconcile(&self, key: &Key) -> Result<Outcome, ReconcileError> {
            self.calls.lock().unwrap().push(key.clone());
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(format!("intentional failure (left={left})").into());
            }
            Ok(Outcome::Done)
        }
    }

    async fn drain(pool: WorkerPool, mut rx: mpsc::UnboundedReceiver<isize>) -> isize {
        pool.join().await;
        let mut net = 0;
        while let Ok(delta) = rx.try_recv() {
            net += delta;
        }
        net
    }

    #[tokio::test(start_paused = true)]
    async fn failed_key_is_retried_then_forgotten() {
        let q = queue();
        let reconciler = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
            failures: AtomicU32::new(1),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(
            1,
            Arc::from("test"),
            Arc::clone(&q),
            reconciler.clone(),
            tx,
        );

        q.add("x");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(reconciler.calls.lock().unwrap().len(), 2);
        assert_eq!(q.num_requeues(&Key::from("x")), 0);

        q.shut_down();
        assert_eq!(drain(pool, rx).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_reconcile_is_requeued_and_worker_survives() {
        let q = queue();
        let calls = Arc::new(AtomicU32::new(0));
        let reconciler = reconciler_fn({
            let calls = Arc::clone(&calls);
            move |_key: Key| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        panic!("boom");
                    }
                    let result: Result<Outcome, ReconcileError> = Ok(Outcome::Done);
                    result
                }
            }
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(1, Arc::from("test"), Arc::clone(&q), Arc::new(reconciler), tx);

        q.add("x");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(q.stats().processing, 0);

        q.shut_down();
        assert_eq!(drain(pool, rx).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_after_schedules_next_run() {
        let q = queue();
        let calls = Arc::new(AtomicU32::new(0));
        let reconciler = reconciler_fn({
            let calls = Arc::clone(&calls);
            move |_key: Key| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    let result: Result<Outcome, ReconcileError> =
                        Ok(Outcome::RequeueAfter(Duration::from_secs(30)));
                    result
                }
            }
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(2, Arc::from("test"), Arc::clone(&q), Arc::new(reconciler), tx);

        q.add("periodic");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(q.stats().delayed, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        q.shut_down();
        assert_eq!(drain(pool, rx).await, 0);
    }

    #[tokio::test]
    async fn workers_report_start_and_exit() {
        let q = queue();
        let reconciler = reconciler_fn(|_key: Key| async move {
            let result: Result<Outcome, ReconcileError> = Ok(Outcome::Done);
            result
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(3, Arc::from("test"), Arc::clone(&q), Arc::new(reconciler), tx);
        assert_eq!(pool.len(), 3);

        q.shut_down();
        pool.join().await;

        let mut starts = 0;
        let mut exits = 0;
        while let Ok(delta) = rx.try_recv() {
            if delta > 0 {
                starts += 1;
            } else {
                exits += 1;
            }
        }
        assert_eq!((starts, exits), (3, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_requeue_after_keeps_worker_alive() {
        let q = queue();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let reconciler = reconciler_fn({
            let calls = Arc::clone(&calls);
            move |key: Key| {
                calls.lock().unwrap().push(key.clone());
                async move {
                    let outcome = if key.as_str() == "forever" {
                        Outcome::RequeueAfter(Duration::MAX)
                    } else {
                        Outcome::Done
                    };
                    let result: Result<Outcome, ReconcileError> = Ok(outcome);
                    result
                }
            }
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(1, Arc::from("test"), Arc::clone(&q), Arc::new(reconciler), tx);

        q.add("forever");
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add("next");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *calls.lock().unwrap(),
            vec![Key::from("forever"), Key::from("next")]
        );
        assert_eq!(q.stats().delayed, 1);
        assert_eq!(q.len(), 0);

        q.shut_down();
        assert_eq!(drain(pool, rx).await, 0);
    }

    struct SetOnDrop(Arc<AtomicBool>);

    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_worker_cancels_its_reconcile() {
        let q = queue();
        let cancelled = Arc::new(AtomicBool::new(false));
        let reconciler = reconciler_fn({
            let cancelled = Arc::clone(&cancelled);
            move |_key: Key| {
                let guard = SetOnDrop(Arc::clone(&cancelled));
                async move {
                    let _guard = guard;
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    let result: Result<Outcome, ReconcileError> = Ok(Outcome::Done);
                    result
                }
            }
        });
        let worker = Worker {
            id: 0,
            controller: Arc::from("test"),
            queue: Arc::clone(&q),
            reconciler: Arc::new(reconciler),
        };

        q.add("stuck");
        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.stats().processing, 1);
        assert!(!cancelled.load(Ordering::SeqCst));

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(q.stats().processing, 0);
    }
}
