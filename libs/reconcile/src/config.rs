//! Controller configuration.

use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::error::ControllerError;
use crate::queue::MAX_SCHEDULE_DELAY;

/// Default number of workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default base delay for per-key retry backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default cap for per-key retry backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Default number of attempts before a failing key is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Controller configuration. Plain values, fixed for the controller lifetime.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name used for the queue and in logs.
    pub name: String,

    /// Number of concurrent workers.
    pub workers: usize,

    /// Base delay of the per-key exponential backoff.
    pub base_delay: Duration,

    /// Maximum delay of the per-key exponential backoff.
    pub max_delay: Duration,

    /// Attempts before a failing key is forgotten and dropped.
    pub max_retries: u32,

    /// Interval between full resync sweeps; `None` disables resync.
    pub resync_interval: Option<Duration>,

    /// Overall requeue rate limit (tokens per second).
    pub qps: f64,

    /// Overall requeue burst size.
    pub burst: u32,

    /// Backoff between relists after the watch stream ends.
    pub relist_backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "controller".to_string(),
            workers: DEFAULT_WORKERS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            resync_interval: Some(DEFAULT_RESYNC_INTERVAL),
            qps: 10.0,
            burst: 100,
            relist_backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

impl ControllerConfig {
    /// Per-key retry backoff policy.
    pub fn retry_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.max_delay)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        if self.workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(ControllerError::InvalidConfig(format!(
                "base_delay {:?} exceeds max_delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.max_delay > MAX_SCHEDULE_DELAY {
            return Err(ControllerError::InvalidConfig(format!(
                "max_delay {:?} exceeds {:?}",
                self.max_delay, MAX_SCHEDULE_DELAY
            )));
        }
        if self.qps.is_nan() || self.qps <= 0.0 {
            return Err(ControllerError::InvalidConfig(format!(
                "qps must be positive, got {}",
                self.qps
            )));
        }
        if self.burst == 0 {
            return Err(ControllerError::InvalidConfig(
                "burst must be at least 1".to_string(),
            ));
        }
        if self.resync_interval.is_some_and(|i| i.is_zero()) {
            return Err(ControllerError::InvalidConfig(
                "resync_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
