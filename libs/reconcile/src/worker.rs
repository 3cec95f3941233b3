//! Worker pool that drains the work queue into the reconciler.
//!
//! Each worker is a sequential loop: take a key, look it up in the cache,
//! reconcile (or clean up if the key is gone), translate the result into a
//! queue action, emit a [`ReconcileRecord`], and mark the key done. The only
//! state shared between workers is the queue and the cache.
//!
//! Every reconcile runs in its own task so a panic is contained and reported
//! as a retryable failure. `done` is called from a drop guard on every path.

use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::error::{ReconcileError, ReconcileResult};
use crate::key::ObjectKey;
use crate::object::Resource;
use crate::observe::{ControllerStats, Outcome, ReconcileObserver, ReconcileRecord};
use crate::queue::WorkQueue;
use crate::reconciler::{Action, ReconcileContext, Reconciler};
use crate::shutdown::wait_for_shutdown;
use crate::store::Store;

/// Calls `done` for a key when dropped.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<ObjectKey>,
    key: &'a ObjectKey,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

/// Pool of workers sharing one queue and one cache.
pub struct WorkerPool<R> {
    queue: Arc<WorkQueue<ObjectKey>>,
    store: Arc<Store<R>>,
    reconciler: Arc<dyn Reconciler<R>>,
    observer: Arc<dyn ReconcileObserver>,
    stats: Arc<ControllerStats>,
    max_retries: u32,
}

impl<R: Resource> WorkerPool<R> {
    pub fn new(
        queue: Arc<WorkQueue<ObjectKey>>,
        store: Arc<Store<R>>,
        reconciler: Arc<dyn Reconciler<R>>,
        observer: Arc<dyn ReconcileObserver>,
        stats: Arc<ControllerStats>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            store,
            reconciler,
            observer,
            stats,
            max_retries,
        }
    }

    /// Run `concurrency` workers until shutdown is signaled or the queue is
    /// shut down and drained. Returns once every in-flight reconcile has
    /// finished.
    #[instrument(skip(self, shutdown), fields(queue = %self.queue.name()))]
    pub async fn run(self: Arc<Self>, concurrency: usize, shutdown: watch::Receiver<bool>) {
        info!(workers = concurrency, "Starting workers");

        let mut workers = JoinSet::new();
        for id in 0..concurrency {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.spawn(async move { pool.run_worker(id, shutdown).await });
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }

        info!("All workers stopped");
    }

    async fn run_worker(&self, id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = id, "Worker started");

        loop {
            let key = tokio::select! {
                biased;

                _ = wait_for_shutdown(&mut shutdown) => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(key, &shutdown).await;
        }

        debug!(worker = id, "Worker stopped");
    }

    /// Process one key taken from the queue.
    pub async fn process(&self, key: ObjectKey, shutdown: &watch::Receiver<bool>) -> Outcome {
        let _done = DoneGuard {
            queue: &self.queue,
            key: &key,
        };

        let retry_count = self.queue.num_requeues(&key);
        let ctx = ReconcileContext::new(key.clone(), retry_count, shutdown.clone());

        let started = Instant::now();
        let result = self.invoke(ctx).await;
        let outcome = self.handle_result(&key, retry_count, result);

        let record = ReconcileRecord {
            key: key.clone(),
            outcome,
            duration: started.elapsed(),
            retry_count,
        };
        self.stats.record(&record.outcome);
        self.observer.observe(&record);
        record.outcome
    }

    /// Route to reconcile or cleanup on its own task.
    async fn invoke(&self, ctx: ReconcileContext) -> ReconcileResult<Action> {
        let reconciler = Arc::clone(&self.reconciler);
        let cached = self.store.get(ctx.key());

        let task = tokio::spawn(async move {
            match cached {
                Some(obj) => reconciler.reconcile(obj, &ctx).await,
                None => reconciler.cleanup(ctx.key(), &ctx).await,
            }
        });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                self.stats.panics.fetch_add(1, Ordering::Relaxed);
                Err(ReconcileError::Panicked(panic_message(e.into_panic())))
            }
            Err(e) => Err(ReconcileError::Transient(format!(
                "reconcile task cancelled: {e}"
            ))),
        }
    }

    /// Apply the retry policy to a reconcile result.
    fn handle_result(
        &self,
        key: &ObjectKey,
        retry_count: u32,
        result: ReconcileResult<Action>,
    ) -> Outcome {
        match result {
            Ok(action) => {
                if let Some(delay) = action.requeue_delay() {
                    self.queue.forget(key);
                    self.queue.add_after(key.clone(), delay);
                    Outcome::RequeuedAfter(delay)
                } else if action.is_requeue() {
                    self.retry(key, retry_count, Outcome::Requeued, "requeue requested")
                } else {
                    self.queue.forget(key);
                    Outcome::Success
                }
            }
            Err(ReconcileError::NotFound(_)) => {
                self.queue.forget(key);
                Outcome::Gone
            }
            Err(e) if e.is_retryable() => {
                let reason = e.to_string();
                self.retry(key, retry_count, Outcome::Retrying(reason.clone()), &reason)
            }
            Err(e) => {
                self.queue.forget(key);
                Outcome::Dropped(e.to_string())
            }
        }
    }

    /// Requeue with backoff, or give up once `max_retries` attempts failed.
    fn retry(&self, key: &ObjectKey, retry_count: u32, requeued: Outcome, reason: &str) -> Outcome {
        let attempts = retry_count.saturating_add(1);
        if attempts < self.max_retries {
            self.queue.add_rate_limited(key.clone());
            requeued
        } else {
            self.queue.forget(key);
            Outcome::Dropped(format!("giving up after {attempts} attempts: {reason}"))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
