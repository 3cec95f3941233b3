//! Per-attempt reconcile records and controller statistics.
//!
//! Every reconcile attempt produces one [`ReconcileRecord`]. How records are
//! rendered is up to the [`ReconcileObserver`]; [`TracingObserver`] logs them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::key::ObjectKey;

/// Result of one reconcile attempt, as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Converged; retry state forgotten.
    Success,
    /// Reconciler asked for a rate-limited requeue.
    Requeued,
    /// Reconciler asked to be called again after a fixed delay.
    RequeuedAfter(Duration),
    /// Retryable failure; the key was requeued with backoff.
    Retrying(String),
    /// The key was given up on (retries exhausted or permanent error).
    Dropped(String),
    /// The resource was already gone; nothing left to do.
    Gone,
}

impl Outcome {
    /// Returns true for the terminal give-up outcome.
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Requeued => "requeued",
            Self::RequeuedAfter(_) => "requeued_after",
            Self::Retrying(_) => "retrying",
            Self::Dropped(_) => "dropped",
            Self::Gone => "gone",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One reconcile attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRecord {
    pub key: ObjectKey,
    pub outcome: Outcome,
    pub duration: Duration,
    /// Consecutive failures before this attempt.
    pub retry_count: u32,
}

/// Receives a record for every reconcile attempt.
pub trait ReconcileObserver: Send + Sync + 'static {
    fn observe(&self, record: &ReconcileRecord);
}

/// Logs reconcile records with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ReconcileObserver for TracingObserver {
    fn observe(&self, record: &ReconcileRecord) {
        let key = &record.key;
        let duration_ms = u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX);
        let retry_count = record.retry_count;
        match &record.outcome {
            Outcome::Success => debug!(%key, duration_ms, retry_count, "Successfully synced"),
            Outcome::Gone => debug!(%key, duration_ms, "Resource gone, dropping key"),
            Outcome::Requeued => info!(%key, duration_ms, retry_count, "Reconcile requested requeue"),
            Outcome::RequeuedAfter(delay) => debug!(
                %key,
                duration_ms,
                requeue_after = ?delay,
                "Reconcile scheduled recheck"
            ),
            Outcome::Retrying(err) => warn!(
                %key,
                duration_ms,
                retry_count,
                error = %err,
                "Error syncing, will retry"
            ),
            Outcome::Dropped(err) => error!(
                %key,
                duration_ms,
                retry_count,
                error = %err,
                "Dropping key out of the queue"
            ),
        }
    }
}

/// Controller statistics.
#[derive(Debug, Default)]
pub struct ControllerStats {
    pub reconciles: AtomicU64,
    pub successes: AtomicU64,
    pub retries: AtomicU64,
    pub drops: AtomicU64,
    pub panics: AtomicU64,
    pub resyncs: AtomicU64,
    pub malformed_events: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reconciles: u64,
    pub successes: u64,
    pub retries: u64,
    pub drops: u64,
    pub panics: u64,
    pub resyncs: u64,
    pub malformed_events: u64,
}

impl ControllerStats {
    /// Count one attempt by its outcome.
    pub fn record(&self, outcome: &Outcome) {
        self.reconciles.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Success | Outcome::RequeuedAfter(_) | Outcome::Gone => &self.successes,
            Outcome::Requeued | Outcome::Retrying(_) => &self.retries,
            Outcome::Dropped(_) => &self.drops,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reconciles: self.reconciles.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            malformed_events: self.malformed_events.load(Ordering::Relaxed),
        }
    }
}
