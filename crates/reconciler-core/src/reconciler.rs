use std::future::Future;

use async_trait::async_trait;

use crate::domain::{Key, Outcome};
use crate::error::ReconcileError;

/// Drives the resource behind `key` toward its desired state.
///
/// The engine never calls `reconcile` concurrently for the same key, and the
/// key is already marked processing when it is called. Implementations should
/// be idempotent: a key may be reconciled again at any time.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &Key) -> Result<Outcome, ReconcileError>;
}

/// Reconciler backed by an async closure. See [`reconciler_fn`].
pub struct FnReconciler<F> {
    f: F,
}

/// Wrap an async closure as a [`Reconciler`].
///
/// ```ignore
/// let reconciler = reconciler_fn(|key| async move {
///     println!("reconciling {key}");
///     Ok(Outcome::Done)
/// });
/// ```
pub fn reconciler_fn<F, Fut>(f: F) -> FnReconciler<F>
where
    F: Fn(Key) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, ReconcileError>> + Send,
{
    FnReconciler { f }
}

#[async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(Key) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, ReconcileError>> + Send,
{
    async fn reconcile(&self, key: &Key) -> Result<Outcome, ReconcileError> {
        (self.f)(key.clone()).await
    }
}
