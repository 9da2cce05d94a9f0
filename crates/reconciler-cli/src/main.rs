use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use reconciler_core::source::{EnqueueHandler, ResourceEvent, ResourceEventHandler, SyncFlag};
use reconciler_core::{Controller, ControllerConfig, ControllerError, Key, Outcome, ReconcileError, Reconciler};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Run a demo controller against a simulated resource collection.
#[derive(Debug, Parser)]
#[command(name = "reconciler", version)]
struct Args {
    /// JSON controller configuration; defaults are used for missing fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `concurrent_syncs` from the configuration.
    #[arg(long)]
    workers: Option<usize>,

    /// Number of objects in the simulated collection.
    #[arg(long, default_value_t = 20)]
    objects: usize,

    /// Probability that a single reconcile fails.
    #[arg(long, default_value_t = 0.2)]
    failure_rate: f64,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for: Option<u64>,
}

#[derive(Debug, Clone)]
struct DemoObject {
    namespace: String,
    name: String,
    generation: u64,
}

fn object_key(obj: &DemoObject) -> Option<Key> {
    if obj.name.is_empty() {
        return None;
    }
    Some(Key::namespaced(&obj.namespace, &obj.name))
}

/// Pretends to converge an object; fails at random to exercise the backoff path.
struct DemoReconciler {
    failure_rate: f64,
    reconciled: AtomicU64,
}

#[async_trait]
impl Reconciler for DemoReconciler {
    async fn reconcile(&self, key: &Key) -> Result<Outcome, ReconcileError> {
        let (fail, work_ms) = {
            let mut rng = rand::thread_rng();
            (rng.gen_bool(self.failure_rate), rng.gen_range(10..200))
        };
        tokio::time::sleep(Duration::from_millis(work_ms)).await;

        if fail {
            return Err(format!("simulated failure for {key}").into());
        }

        let total = self.reconciled.fetch_add(1, Ordering::Relaxed) + 1;
        let (namespace, name) = key.split();
        info!(namespace, name, total, "reconciled");
        Ok(Outcome::Done)
    }
}

/// Initial listing followed by a trickle of updates, like a watch would deliver.
async fn simulate_watch(
    handler: impl ResourceEventHandler<DemoObject>,
    synced: SyncFlag,
    objects: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut current: Vec<DemoObject> = (0..objects)
        .map(|i| DemoObject {
            namespace: "demo".to_string(),
            name: format!("object-{i}"),
            generation: 1,
        })
        .collect();

    for obj in &current {
        handler.handle(&ResourceEvent::Added(obj.clone()));
    }
    synced.mark_synced();
    info!(objects, "initial listing delivered");

    if current.is_empty() {
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            _ = ticker.tick() => {}
        }
        let idx = rand::thread_rng().gen_range(0..current.len());
        let old = current[idx].clone();
        current[idx].generation += 1;
        handler.handle(&ResourceEvent::Updated {
            old,
            new: current[idx].clone(),
        });
    }
}

fn load_config(args: &Args) -> Result<ControllerConfig, ControllerError> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.concurrent_syncs = workers;
    }
    Ok(config)
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let reconciler = DemoReconciler {
        failure_rate: args.failure_rate.clamp(0.0, 1.0),
        reconciled: AtomicU64::new(0),
    };

    let mut controller = Controller::new("demo", config, reconciler)?;
    let synced = SyncFlag::new();
    controller.add_sync_check(synced.checker());
    let handler = EnqueueHandler::new(controller.queue(), object_key).with_updates();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watch_task = tokio::spawn(simulate_watch(
        handler,
        synced,
        args.objects,
        shutdown_rx.clone(),
    ));

    let controller = Arc::new(controller);
    let run = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    match args.run_for {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {e}");
            }
        }
    }
    info!(stats = ?controller.queue().stats(), "shutdown requested");
    // ignore send error: the controller may already have stopped
    let _ = shutdown_tx.send(true);

    let _ = watch_task.await;
    controller_exit(run.await)
}

/// A panicked controller task is a failure too.
fn controller_exit(
    joined: Result<Result<(), ControllerError>, JoinError>,
) -> Result<(), Box<dyn std::error::Error>> {
    joined??;
    Ok(())
}
