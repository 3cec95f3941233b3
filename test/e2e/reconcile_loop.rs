//! End-to-end tests of the reconcile loop.
//!
//! Each test wires a full controller to the in-memory source and the
//! recording reconciler, then drives changes through the source and checks
//! what the reconciler observed:
//!
//! 1. Changes during processing cause exactly one more pass
//! 2. A key that always fails is reconciled `max_retries` times, then dropped
//! 3. A delete during processing routes the next pass to cleanup
//! 4. No key is ever reconciled concurrently under load
//! 5. Periodic resync re-reconciles unchanged keys without overlap
//! 6. Shutdown waits for in-flight reconciles
//!
//! ## Running
//!
//! ```bash
//! cargo test -p converge-e2e --test reconcile_loop
//! ```

use std::sync::Arc;
use std::time::Duration;

use converge_reconcile::{
    Controller, ControllerConfig, Object, Outcome, ReconcileObserver, Reconciler, Resource,
    Source, WatchEvent,
};
use converge_testing::{
    eventually, init_tracing, key, object, Behavior, CallKind, FakeSource, RecordingObserver,
    RecordingReconciler, RunningController,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        name: "e2e".to_string(),
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(50),
        resync_interval: None,
        qps: 1000.0,
        burst: 1000,
        ..Default::default()
    }
}

fn start(
    config: ControllerConfig,
    source: &Arc<FakeSource>,
    reconciler: &Arc<RecordingReconciler>,
    observer: &Arc<RecordingObserver>,
) -> RunningController {
    init_tracing();
    let source: Arc<dyn Source<Object>> = source.clone();
    let reconciler: Arc<dyn Reconciler<Object>> = reconciler.clone();
    let observer: Arc<dyn ReconcileObserver> = observer.clone();
    let controller = Controller::new(config, source, reconciler)
        .unwrap()
        .with_observer(observer);
    RunningController::start(controller)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_changes_while_processing_cause_one_more_pass() {
    let k = key("default", "web");
    let source = Arc::new(FakeSource::with_objects([object("default", "web")]));
    let reconciler = Arc::new(RecordingReconciler::new());
    let observer = Arc::new(RecordingObserver::new());
    let gate = reconciler.gate(&k);

    let running = start(fast_config(), &source, &reconciler, &observer);

    gate.wait_entered(1).await;
    eventually(WAIT, || source.open_watches() == 1).await;

    // Three changes land while the first pass is held.
    source.upsert(object("default", "web"));
    source.upsert(object("default", "web"));
    let latest = source.upsert(object("default", "web"));
    eventually(WAIT, || {
        running
            .store
            .get(&k)
            .is_some_and(|cached| cached.resource_version() == latest.resource_version())
    })
    .await;

    gate.open();
    eventually(WAIT, || observer.for_key(&k).len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = reconciler.calls_for(&k);
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].version.as_deref(), latest.resource_version());
    assert_eq!(reconciler.overlaps(), 0);

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_always_failing_key_is_dropped_after_max_retries() {
    let k = key("default", "broken");
    let source = Arc::new(FakeSource::with_objects([
        object("default", "broken"),
        object("default", "healthy"),
    ]));
    let reconciler = Arc::new(RecordingReconciler::new());
    reconciler.fallback(&k, Behavior::Transient);
    let observer = Arc::new(RecordingObserver::new());

    let running = start(
        ControllerConfig {
            max_retries: 3,
            ..fast_config()
        },
        &source,
        &reconciler,
        &observer,
    );

    eventually(WAIT, || observer.dropped() == vec![k.clone()]).await;
    // Nothing is requeued after the drop.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(reconciler.call_count(&k), 3);
    let retry_counts: Vec<u32> = observer.for_key(&k).iter().map(|r| r.retry_count).collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    let outcomes = observer.outcomes(&k);
    assert!(matches!(outcomes[0], Outcome::Retrying(_)));
    assert!(matches!(outcomes[1], Outcome::Retrying(_)));
    assert!(outcomes[2].is_dropped());

    assert_eq!(
        observer.outcomes(&key("default", "healthy")),
        vec![Outcome::Success]
    );

    let stats = running.stop().await.unwrap();
    assert_eq!(stats.drops, 1);
    assert_eq!(stats.retries, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_permanent_error_is_not_retried() {
    let k = key("default", "invalid");
    let source = Arc::new(FakeSource::with_objects([object("default", "invalid")]));
    let reconciler = Arc::new(RecordingReconciler::new());
    reconciler.fallback(&k, Behavior::Permanent);
    let observer = Arc::new(RecordingObserver::new());

    let running = start(fast_config(), &source, &reconciler, &observer);

    eventually(WAIT, || !observer.dropped().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reconciler.call_count(&k), 1);

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panic_is_retried_and_recovers() {
    let k = key("default", "flaky");
    let source = Arc::new(FakeSource::with_objects([object("default", "flaky")]));
    let reconciler = Arc::new(RecordingReconciler::new());
    reconciler.script(&k, [Behavior::Panic, Behavior::Succeed]);
    let observer = Arc::new(RecordingObserver::new());

    let running = start(fast_config(), &source, &reconciler, &observer);

    eventually(WAIT, || observer.outcomes(&k).last() == Some(&Outcome::Success)).await;
    let outcomes = observer.outcomes(&k);
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(&outcomes[0], Outcome::Retrying(e) if e.contains("panicked")));

    let stats = running.stop().await.unwrap();
    assert_eq!(stats.panics, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requeue_after_schedules_another_pass() {
    let k = key("default", "poll");
    let source = Arc::new(FakeSource::with_objects([object("default", "poll")]));
    let reconciler = Arc::new(RecordingReconciler::new());
    reconciler.script(&k, [Behavior::RequeueAfter(Duration::from_millis(30))]);
    let observer = Arc::new(RecordingObserver::new());

    let running = start(fast_config(), &source, &reconciler, &observer);

    eventually(WAIT, || observer.for_key(&k).len() == 2).await;
    assert_eq!(
        observer.outcomes(&k),
        vec![
            Outcome::RequeuedAfter(Duration::from_millis(30)),
            Outcome::Success
        ]
    );
    // Scheduled rechecks do not count as failures.
    assert_eq!(observer.for_key(&k)[1].retry_count, 0);

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_while_processing_routes_to_cleanup() {
    let k = key("default", "web");
    let source = Arc::new(FakeSource::with_objects([object("default", "web")]));
    let reconciler = Arc::new(RecordingReconciler::new());
    let observer = Arc::new(RecordingObserver::new());
    let gate = reconciler.gate(&k);

    let running = start(fast_config(), &source, &reconciler, &observer);

    gate.wait_entered(1).await;
    eventually(WAIT, || source.open_watches() == 1).await;
    source.delete(&k);
    eventually(WAIT, || running.store.get(&k).is_none()).await;

    gate.open();
    eventually(WAIT, || reconciler.call_count(&k) == 2).await;

    let kinds: Vec<CallKind> = reconciler.calls_for(&k).iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![CallKind::Reconcile, CallKind::Cleanup]);
    assert_eq!(reconciler.overlaps(), 0);

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_key_is_processed_concurrently_under_load() {
    let names: Vec<String> = (0..10).map(|i| format!("obj-{i}")).collect();
    let source = Arc::new(FakeSource::with_objects(
        names.iter().map(|name| object("default", name)),
    ));
    let reconciler = Arc::new(RecordingReconciler::with_work(Duration::from_millis(1)));
    let observer = Arc::new(RecordingObserver::new());

    let running = start(
        ControllerConfig {
            workers: 4,
            ..fast_config()
        },
        &source,
        &reconciler,
        &observer,
    );
    eventually(WAIT, || source.open_watches() == 1).await;

    for round in 0..20 {
        for name in &names {
            source.upsert(object("default", name));
        }
        if round % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    // Every key converges on its latest version.
    eventually(WAIT, || {
        names.iter().all(|name| {
            let k = key("default", name);
            let latest = source.get(&k).and_then(|o| o.resource_version().map(str::to_string));
            reconciler.calls_for(&k).last().map(|c| c.version.clone()) == Some(latest)
        })
    })
    .await;

    assert_eq!(reconciler.overlaps(), 0);
    assert!(reconciler.max_concurrency() <= 4);
    // Bursts of notifications are coalesced.
    assert!(reconciler.total_calls() < names.len() * 21);

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resync_rereconciles_unchanged_keys() {
    let source = Arc::new(FakeSource::with_objects([
        object("default", "a"),
        object("default", "b"),
    ]));
    let reconciler = Arc::new(RecordingReconciler::new());
    let observer = Arc::new(RecordingObserver::new());

    let running = start(
        ControllerConfig {
            resync_interval: Some(Duration::from_millis(40)),
            ..fast_config()
        },
        &source,
        &reconciler,
        &observer,
    );

    eventually(WAIT, || {
        reconciler.call_count(&key("default", "a")) >= 3
            && reconciler.call_count(&key("default", "b")) >= 3
    })
    .await;

    assert_eq!(reconciler.overlaps(), 0);
    assert!(observer
        .records()
        .iter()
        .all(|record| record.outcome == Outcome::Success));
    // Resync never changes what the reconciler sees.
    let versions: Vec<_> = reconciler
        .calls_for(&key("default", "a"))
        .into_iter()
        .map(|c| c.version)
        .collect();
    assert!(versions.windows(2).all(|w| w[0] == w[1]));

    let stats = running.stop().await.unwrap();
    assert!(stats.resyncs >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_notification_is_dropped() {
    let source = Arc::new(FakeSource::new());
    let reconciler = Arc::new(RecordingReconciler::new());
    let observer = Arc::new(RecordingObserver::new());

    let running = start(fast_config(), &source, &reconciler, &observer);
    eventually(WAIT, || source.open_watches() == 1).await;

    source.send(WatchEvent::Added(object("default", "")));
    source.upsert(object("default", "valid"));

    eventually(WAIT, || reconciler.total_calls() == 1).await;
    eventually(WAIT, || running.stats.snapshot().malformed_events == 1).await;
    assert_eq!(running.store.len(), 1);

    running.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_reconcile() {
    let k = key("default", "slow");
    let source = Arc::new(FakeSource::with_objects([object("default", "slow")]));
    let reconciler = Arc::new(RecordingReconciler::new());
    let observer = Arc::new(RecordingObserver::new());
    let gate = reconciler.gate(&k);

    let running = start(fast_config(), &source, &reconciler, &observer);
    gate.wait_entered(1).await;

    running.signal_shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!running.is_finished());

    gate.open();
    let stats = running.join().await.unwrap();
    assert_eq!(stats.successes, 1);
    assert_eq!(observer.outcomes(&k), vec![Outcome::Success]);
}
