//! Periodic resync.
//!
//! Every interval, every key in the cache is enqueued. Queue dedup absorbs
//! keys that are already pending, so a sweep never causes overlapping work.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::key::ObjectKey;
use crate::object::Resource;
use crate::observe::ControllerStats;
use crate::queue::WorkQueue;
use crate::shutdown::wait_for_shutdown;
use crate::store::Store;

/// Re-enqueues every cached key on a fixed interval.
pub struct Resync<R> {
    store: Arc<Store<R>>,
    queue: Arc<WorkQueue<ObjectKey>>,
    interval: Duration,
    stats: Arc<ControllerStats>,
}

impl<R: Resource> Resync<R> {
    pub fn new(
        store: Arc<Store<R>>,
        queue: Arc<WorkQueue<ObjectKey>>,
        interval: Duration,
        stats: Arc<ControllerStats>,
    ) -> Self {
        Self {
            store,
            queue,
            interval,
            stats,
        }
    }

    /// Enqueue every cached key. Returns the number of keys swept.
    pub fn sweep(&self) -> usize {
        let keys = self.store.list_keys();
        let count = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Sweep on every tick until shutdown.
    #[instrument(skip_all, name = "resync", fields(interval_secs = self.interval.as_secs()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; the initial list already enqueued everything.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let keys = self.sweep();
                    debug!(keys, "Resync sweep");
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        debug!("Resync stopped");
    }
}
