//! Level-triggered reconciliation engine.
//!
//! Converges external state toward the desired state of a set of resources.
//! A [`Source`] lists and watches resources; the [`Informer`] mirrors them
//! into a [`Store`] and the [`EventTranslator`] turns every change into a
//! bare key on the [`WorkQueue`]. A pool of workers pulls keys, reads the
//! latest cached state, and calls the user's [`Reconciler`]. Failures are
//! retried with per-key exponential backoff; a periodic resync re-enqueues
//! every cached key to correct missed notifications.
//!
//! # Invariants
//!
//! - A key is processed by at most one worker at a time
//! - A key is queued at most once, however many notifications arrive
//! - A key marked dirty while processing is processed again afterwards
//! - Reconcile always sees the latest cached state, never the notification
//! - Retry delays for a key never decrease until the key is forgotten
//!
//! # Example
//!
//! ```ignore
//! let controller = Controller::new(ControllerConfig::default(), source, reconciler)?;
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let stats = controller.run(shutdown_rx).await?;
//! ```

pub mod backoff;
pub mod config;
pub mod controller;
pub mod error;
pub mod informer;
pub mod key;
pub mod object;
pub mod observe;
pub mod queue;
pub mod reconciler;
pub mod resync;
pub mod shutdown;
pub mod source;
pub mod store;
pub mod translator;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backoff::{
    default_controller_limiter, BackoffPolicy, ItemExponentialLimiter, MaxOfLimiter, RateLimiter,
    TokenBucketLimiter,
};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{ControllerError, KeyError, ReconcileError, ReconcileResult, SourceError};
pub use informer::Informer;
pub use key::ObjectKey;
pub use object::{Object, ObjectMeta, Resource, SpecHash};
pub use observe::{
    ControllerStats, Outcome, ReconcileObserver, ReconcileRecord, StatsSnapshot, TracingObserver,
};
pub use queue::{WorkQueue, MAX_SCHEDULE_DELAY};
pub use reconciler::{Action, ReconcileContext, Reconciler};
pub use resync::Resync;
pub use source::{Source, WatchEvent, WatchStream};
pub use store::{CacheEntry, PutOutcome, Store};
pub use translator::{EventTranslator, UpdateFilter};
pub use worker::WorkerPool;
