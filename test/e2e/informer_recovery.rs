//! End-to-end tests of cache recovery.
//!
//! When the watch stream ends, the informer relists the source and replaces
//! the cache. Changes missed while no stream was open must still reach the
//! reconciler: new objects are reconciled and vanished ones are cleaned up.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p converge-e2e --test informer_recovery
//! ```

use std::sync::Arc;
use std::time::Duration;

use converge_reconcile::{
    BackoffPolicy, Controller, ControllerConfig, ControllerError, Object, ReconcileObserver,
    Reconciler, Source,
};
use converge_testing::{
    eventually, init_tracing, key, object, CallKind, FakeSource, RecordingObserver,
    RecordingReconciler, RunningController,
};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ControllerConfig {
    ControllerConfig {
        name: "recovery".to_string(),
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(50),
        resync_interval: None,
        relist_backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        ..Default::default()
    }
}

fn controller(source: &Arc<FakeSource>, reconciler: &Arc<RecordingReconciler>) -> Controller<Object> {
    init_tracing();
    let source: Arc<dyn Source<Object>> = source.clone();
    let reconciler: Arc<dyn Reconciler<Object>> = reconciler.clone();
    Controller::new(config(), source, reconciler).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_end_relists_and_catches_up() {
    let source = Arc::new(FakeSource::with_objects([
        object("default", "kept"),
        object("default", "removed"),
    ]));
    let reconciler = Arc::new(RecordingReconciler::new());
    let running = RunningController::start(controller(&source, &reconciler));

    eventually(WAIT, || reconciler.total_calls() == 2 && source.open_watches() == 1).await;

    // Changes happen while nobody is listening, then the stream drops.
    source.upsert_silently(object("default", "added"));
    source.delete_silently(&key("default", "removed"));
    source.close_watches();

    eventually(WAIT, || {
        reconciler.call_count(&key("default", "added")) == 1
            && reconciler.call_count(&key("default", "removed")) == 2
    })
    .await;

    let removed = reconciler.calls_for(&key("default", "removed"));
    assert_eq!(removed[1].kind, CallKind::Cleanup);
    assert!(running.store.get(&key("default", "removed")).is_none());
    // Unchanged objects are not re-reconciled by the relist.
    assert_eq!(reconciler.call_count(&key("default", "kept")), 1);
    assert!(source.list_calls() >= 2);

    // The informer watches again after relisting.
    eventually(WAIT, || source.open_watches() == 1).await;
    source.upsert(object("default", "kept"));
    eventually(WAIT, || reconciler.call_count(&key("default", "kept")) == 2).await;

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relist_retries_after_list_failures() {
    let source = Arc::new(FakeSource::with_objects([object("default", "a")]));
    let reconciler = Arc::new(RecordingReconciler::new());
    let running = RunningController::start(controller(&source, &reconciler));

    eventually(WAIT, || source.open_watches() == 1).await;
    source.fail_next_lists(3);
    source.upsert_silently(object("default", "b"));
    source.close_watches();

    eventually(WAIT, || reconciler.call_count(&key("default", "b")) == 1).await;
    // Initial list, three failures, one success.
    assert!(source.list_calls() >= 5);

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initial_list_failure_stops_controller() {
    let source = Arc::new(FakeSource::with_objects([object("default", "a")]));
    source.fail_next_lists(1);
    let reconciler = Arc::new(RecordingReconciler::new());
    let observer: Arc<dyn ReconcileObserver> = Arc::new(RecordingObserver::new());
    let running =
        RunningController::start(controller(&source, &reconciler).with_observer(observer));

    let err = running.join().await.unwrap_err();
    assert!(matches!(err, ControllerError::InitialList(_)));
    assert_eq!(reconciler.total_calls(), 0);
}
