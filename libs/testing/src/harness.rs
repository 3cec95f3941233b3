use std::sync::Arc;

use converge_reconcile::{
    Controller, ControllerError, ControllerStats, Object, ObjectKey, StatsSnapshot, Store,
    WorkQueue,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A controller running on its own task.
pub struct RunningController {
    pub store: Arc<Store<Object>>,
    pub queue: Arc<WorkQueue<ObjectKey>>,
    pub stats: Arc<ControllerStats>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<StatsSnapshot, ControllerError>>,
}

impl RunningController {
    /// Spawn `controller.run` with a fresh shutdown channel.
    pub fn start(controller: Controller<Object>) -> Self {
        let store = controller.store();
        let queue = controller.queue();
        let stats = controller.stats();
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(rx));
        Self {
            store,
            queue,
            stats,
            shutdown,
            handle,
        }
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the controller to return without signaling it.
    pub async fn join(self) -> Result<StatsSnapshot, ControllerError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => panic!("controller task failed: {e}"),
        }
    }

    /// Signal shutdown and wait for the controller to return.
    pub async fn stop(self) -> Result<StatsSnapshot, ControllerError> {
        self.signal_shutdown();
        self.join().await
    }
}
