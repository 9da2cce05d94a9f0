//! Event source adapter: turns watch notifications into queue keys.
//!
//! The watch itself (listing, streaming, caching) lives outside this crate.
//! It delivers [`ResourceEvent`]s to a [`ResourceEventHandler`] and flips a
//! [`SyncFlag`] once its initial listing is complete.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::domain::Key;
use crate::queue::WorkQueue;

/// Readiness predicate polled by the controller before it starts workers.
pub type SyncCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// A change notification for one object.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(T),
}

/// Callback interface for watch notifications. Called synchronously from the
/// watch-delivery context, so implementations must not block.
pub trait ResourceEventHandler<T>: Send + Sync {
    fn on_add(&self, _obj: &T) {}

    fn on_update(&self, _old: &T, _new: &T) {}

    fn on_delete(&self, _obj: &T) {}

    fn handle(&self, event: &ResourceEvent<T>) {
        match event {
            ResourceEvent::Added(obj) => self.on_add(obj),
            ResourceEvent::Updated { old, new } => self.on_update(old, new),
            ResourceEvent::Deleted(obj) => self.on_delete(obj),
        }
    }
}

/// Handler that enqueues the key of each notified object.
///
/// Adds are always enqueued; updates and deletes only when enabled with
/// [`with_updates`](Self::with_updates) / [`with_deletes`](Self::with_deletes).
pub struct EnqueueHandler<T, F> {
    queue: Arc<WorkQueue>,
    key_fn: F,
    on_update: bool,
    on_delete: bool,
    _marker: PhantomData<fn(&T)>,
}

impl<T, F> EnqueueHandler<T, F>
where
    F: Fn(&T) -> Option<Key> + Send + Sync,
{
    /// `key_fn` returns `None` for objects that cannot be keyed; those are skipped.
    pub fn new(queue: Arc<WorkQueue>, key_fn: F) -> Self {
        Self {
            queue,
            key_fn,
            on_update: false,
            on_delete: false,
            _marker: PhantomData,
        }
    }

    pub fn with_updates(mut self) -> Self {
        self.on_update = true;
        self
    }

    pub fn with_deletes(mut self) -> Self {
        self.on_delete = true;
        self
    }

    fn enqueue(&self, obj: &T, event: &'static str) {
        match (self.key_fn)(obj) {
            Some(key) => self.queue.add(key),
            None => debug!(queue = %self.queue.name(), event, "object without key skipped"),
        }
    }
}

impl<T, F> ResourceEventHandler<T> for EnqueueHandler<T, F>
where
    F: Fn(&T) -> Option<Key> + Send + Sync,
{
    fn on_add(&self, obj: &T) {
        self.enqueue(obj, "add");
    }

    fn on_update(&self, _old: &T, new: &T) {
        if self.on_update {
            self.enqueue(new, "update");
        }
    }

    fn on_delete(&self, obj: &T) {
        if self.on_delete {
            self.enqueue(obj, "delete");
        }
    }
}

/// "Initial listing complete" flag shared between an event source and the controller.
#[derive(Debug, Clone, Default)]
pub struct SyncFlag(Arc<AtomicBool>);

impl SyncFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_synced(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn has_synced(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Readiness predicate for [`Controller::add_sync_check`](crate::controller::Controller::add_sync_check).
    pub fn checker(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let flag = self.clone();
        move || flag.has_synced()
    }
}
