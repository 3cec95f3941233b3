//! Controller wiring: source, cache, queue, workers and resync.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::backoff::default_controller_limiter;
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::informer::Informer;
use crate::key::ObjectKey;
use crate::object::Resource;
use crate::observe::{ControllerStats, ReconcileObserver, StatsSnapshot, TracingObserver};
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::resync::Resync;
use crate::shutdown::wait_for_shutdown;
use crate::source::Source;
use crate::store::Store;
use crate::translator::{EventTranslator, UpdateFilter};
use crate::worker::WorkerPool;

/// A reconciliation controller for one resource kind.
pub struct Controller<R: Resource> {
    config: ControllerConfig,
    source: Arc<dyn Source<R>>,
    reconciler: Arc<dyn Reconciler<R>>,
    observer: Arc<dyn ReconcileObserver>,
    filter: UpdateFilter<R>,
    store: Arc<Store<R>>,
    queue: Arc<WorkQueue<ObjectKey>>,
    stats: Arc<ControllerStats>,
}

impl<R: Resource> Controller<R> {
    /// Create a controller. Fails if the configuration is invalid.
    pub fn new(
        config: ControllerConfig,
        source: Arc<dyn Source<R>>,
        reconciler: Arc<dyn Reconciler<R>>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;

        let limiter = default_controller_limiter(config.retry_backoff(), config.qps, config.burst);
        let queue = Arc::new(WorkQueue::new(config.name.clone(), limiter));

        Ok(Self {
            config,
            source,
            reconciler,
            observer: Arc::new(TracingObserver),
            filter: UpdateFilter::default(),
            store: Arc::new(Store::new()),
            queue,
            stats: Arc::new(ControllerStats::default()),
        })
    }

    /// Replace the observer that receives a record per reconcile attempt.
    pub fn with_observer(mut self, observer: Arc<dyn ReconcileObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the filter deciding whether an update enqueues its key.
    pub fn with_update_filter(mut self, filter: UpdateFilter<R>) -> Self {
        self.filter = filter;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<Store<R>> {
        Arc::clone(&self.store)
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        Arc::clone(&self.queue)
    }

    pub fn stats(&self) -> Arc<ControllerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown is signaled.
    ///
    /// Workers start only after the initial list has been applied to the
    /// cache. On shutdown, workers stop taking new keys and in-flight
    /// reconciles are awaited before this returns.
    #[instrument(skip_all, fields(controller = %self.config.name))]
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<StatsSnapshot, ControllerError> {
        let Self {
            config,
            source,
            reconciler,
            observer,
            filter,
            store,
            queue,
            stats,
        } = self;

        info!(
            workers = config.workers,
            max_retries = config.max_retries,
            resync_secs = config.resync_interval.map(|i| i.as_secs()),
            "Starting controller"
        );

        let translator = Arc::new(EventTranslator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            filter,
            Arc::clone(&stats),
        ));
        let informer = Arc::new(Informer::new(source, translator, config.relist_backoff));

        let mut stop = shutdown.clone();
        let objects = tokio::select! {
            biased;

            _ = wait_for_shutdown(&mut stop) => {
                info!("Shutdown before cache sync");
                queue.shut_down();
                return Ok(stats.snapshot());
            }
            listed = informer.sync_once() => listed.map_err(ControllerError::InitialList)?,
        };
        info!(objects, "Cache synced");

        let informer_task = tokio::spawn({
            let informer = Arc::clone(&informer);
            let shutdown = shutdown.clone();
            async move { informer.watch_loop(shutdown).await }
        });

        let resync_task = config.resync_interval.map(|interval| {
            let resync = Resync::new(
                Arc::clone(&store),
                Arc::clone(&queue),
                interval,
                Arc::clone(&stats),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { resync.run(shutdown).await })
        });

        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            store,
            reconciler,
            observer,
            Arc::clone(&stats),
            config.max_retries,
        ));
        pool.run(config.workers, shutdown).await;

        queue.shut_down();

        if let Err(e) = informer_task.await {
            error!(error = %e, "Informer task failed");
        }
        if let Some(task) = resync_task {
            if let Err(e) = task.await {
                error!(error = %e, "Resync task failed");
            }
        }

        let snapshot = stats.snapshot();
        info!(
            reconciles = snapshot.reconciles,
            successes = snapshot.successes,
            drops = snapshot.drops,
            "Controller stopped"
        );
        Ok(snapshot)
    }
}
