//! Test doubles for the reconciliation engine.
//!
//! - [`FakeSource`]: in-memory source whose state and notifications are
//!   driven by the test
//! - [`RecordingReconciler`]: records every call, detects overlapping calls
//!   for one key, and replays scripted behaviors
//! - [`RecordingObserver`]: collects reconcile records
//! - [`RunningController`]: a controller spawned with its shutdown handle

mod harness;
mod observer;
mod reconciler;
mod source;

use std::time::Duration;

use converge_reconcile::{Object, ObjectKey};

pub use harness::RunningController;
pub use observer::RecordingObserver;
pub use reconciler::{Behavior, Call, CallKind, Gate, RecordingReconciler};
pub use source::FakeSource;

/// Build a namespaced object with an empty spec and no version.
pub fn object(namespace: &str, name: &str) -> Object {
    object_with_spec(namespace, name, serde_json::json!({}))
}

/// Build a namespaced object with the given spec and no version.
pub fn object_with_spec(namespace: &str, name: &str, spec: serde_json::Value) -> Object {
    let mut obj = Object::new(namespace, name, "", spec);
    obj.metadata.resource_version = None;
    obj
}

/// Shorthand for a namespaced key.
pub fn key(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::namespaced(namespace, name)
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Install a test-friendly subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
