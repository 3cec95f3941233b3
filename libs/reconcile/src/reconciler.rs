//! The reconcile contract.
//!
//! A [`Reconciler`] drives the real world toward the state cached for one key.
//! The engine looks the key up in the cache before every attempt and routes
//! to [`Reconciler::reconcile`] when the object exists, or to
//! [`Reconciler::cleanup`] when it does not. Both must be idempotent: calling
//! them twice with no intervening state change has the same side effects as
//! calling them once.
//!
//! Reconcilers never touch the work queue; retry and backoff are driven purely
//! by the returned [`Action`] or error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::ReconcileResult;
use crate::key::ObjectKey;
use crate::object::Resource;
use crate::shutdown::wait_for_shutdown;

/// What to do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue: bool,
    requeue_after: Option<Duration>,
}

impl Action {
    /// Converged; forget the key until the next change or resync.
    pub fn done() -> Self {
        Self::default()
    }

    /// Not converged yet; retry with rate-limited backoff.
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Check again after a fixed delay. Resets retry state.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    pub fn is_requeue(&self) -> bool {
        self.requeue
    }

    pub fn requeue_delay(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Per-attempt context handed to the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    key: ObjectKey,
    retry_count: u32,
    shutdown: watch::Receiver<bool>,
}

impl ReconcileContext {
    pub fn new(key: ObjectKey, retry_count: u32, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            key,
            retry_count,
            shutdown,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Consecutive failures of this key before this attempt.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown is signaled or the sender is dropped. Long
    /// operations should race against this and return promptly.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        wait_for_shutdown(&mut shutdown).await;
    }
}

/// Domain logic for one resource kind.
#[async_trait]
pub trait Reconciler<R: Resource>: Send + Sync + 'static {
    /// Converge the world toward `obj`.
    async fn reconcile(&self, obj: Arc<R>, ctx: &ReconcileContext) -> ReconcileResult<Action>;

    /// The key is no longer cached: release whatever was created for it.
    async fn cleanup(&self, _key: &ObjectKey, _ctx: &ReconcileContext) -> ReconcileResult<Action> {
        Ok(Action::done())
    }
}
