//! Configuration for the demo controller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use converge_reconcile::config::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES, DEFAULT_RESYNC_INTERVAL,
    DEFAULT_WORKERS,
};
use converge_reconcile::ControllerConfig;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of JSON manifests to watch.
    pub watch_dir: PathBuf,

    /// Directory the mirror reconciler writes into.
    pub output_dir: PathBuf,

    /// Poll interval of the manifest directory.
    pub poll_interval: Duration,

    /// Number of workers.
    pub workers: usize,

    /// Per-key retry backoff base.
    pub base_delay: Duration,

    /// Per-key retry backoff cap.
    pub max_delay: Duration,

    /// Attempts before a failing key is dropped.
    pub max_retries: u32,

    /// Resync interval; 0 disables resync.
    pub resync_interval: Option<Duration>,

    /// Overall requeue rate.
    pub qps: f64,

    /// Overall requeue burst.
    pub burst: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let watch_dir = lookup("CONVERGE_WATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./manifests"));

        let output_dir = lookup("CONVERGE_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./mirror"));

        let poll_ms: u64 = parse(&lookup, "CONVERGE_POLL_MS")?.unwrap_or(500);
        ensure!(poll_ms > 0, "invalid value for CONVERGE_POLL_MS: must be at least 1");
        let poll_interval = Duration::from_millis(poll_ms);

        let workers = parse(&lookup, "CONVERGE_WORKERS")?.unwrap_or(DEFAULT_WORKERS);

        let base_delay = parse(&lookup, "CONVERGE_BASE_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BASE_DELAY);

        let max_delay = parse(&lookup, "CONVERGE_MAX_DELAY_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MAX_DELAY);

        let max_retries = parse(&lookup, "CONVERGE_MAX_RETRIES")?.unwrap_or(DEFAULT_MAX_RETRIES);

        let resync_interval = match parse::<u64>(&lookup, "CONVERGE_RESYNC_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_RESYNC_INTERVAL),
        };

        let qps = parse(&lookup, "CONVERGE_QPS")?.unwrap_or(10.0);
        let burst = parse(&lookup, "CONVERGE_BURST")?.unwrap_or(100);

        let log_level = lookup("CONVERGE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            watch_dir,
            output_dir,
            poll_interval,
            workers,
            base_delay,
            max_delay,
            max_retries,
            resync_interval,
            qps,
            burst,
            log_level,
        })
    }

    /// Engine configuration derived from this configuration.
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            name: "mirror".to_string(),
            workers: self.workers,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            max_retries: self.max_retries,
            resync_interval: self.resync_interval,
            qps: self.qps,
            burst: self.burst,
            ..ControllerConfig::default()
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))
        })
        .transpose()
}
