use std::time::Duration;

use thiserror::Error;

/// Error returned by a [`Reconciler`](crate::reconciler::Reconciler).
///
/// Per-key failures never leave the worker: they are logged and the key is
/// requeued with backoff.
pub type ReconcileError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the controller's public entry points.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid controller configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration: {0}")]
    Config(String),

    #[error("timed out after {waited:?} waiting for {controller} caches to sync")]
    SyncTimeout { controller: String, waited: Duration },

    #[error("controller {0} has already been started")]
    AlreadyStarted(String),
}
