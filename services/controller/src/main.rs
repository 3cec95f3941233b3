//! converge-controller
//!
//! Mirrors a directory of JSON manifests into an output directory using the
//! reconciliation engine. Configuration comes from `CONVERGE_*` environment
//! variables.

use std::sync::Arc;

use anyhow::{Context, Result};
use converge_controller::{Config, FileSource, MirrorReconciler};
use converge_reconcile::{Controller, Object, Reconciler, Source};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        watch_dir = %config.watch_dir.display(),
        output_dir = %config.output_dir.display(),
        workers = config.workers,
        "Configuration loaded"
    );

    let source: Arc<dyn Source<Object>> =
        Arc::new(FileSource::new(&config.watch_dir, config.poll_interval));
    let reconciler: Arc<dyn Reconciler<Object>> =
        Arc::new(MirrorReconciler::new(&config.output_dir));
    let controller = Controller::new(config.controller(), source, reconciler)
        .context("failed to build controller")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run = tokio::spawn(controller.run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut run => {
            return match result {
                Ok(Ok(stats)) => {
                    info!(reconciles = stats.reconciles, "Controller exited");
                    Ok(())
                }
                Ok(Err(e)) => Err(e).context("controller failed"),
                Err(e) => Err(e).context("controller task panicked"),
            };
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Waiting for in-flight reconciles to finish...");

    match run.await {
        Ok(Ok(stats)) => info!(
            reconciles = stats.reconciles,
            successes = stats.successes,
            drops = stats.drops,
            "Controller shutdown complete"
        ),
        Ok(Err(e)) => error!(error = %e, "Controller failed"),
        Err(e) => error!(error = %e, "Controller task panicked"),
    }
    Ok(())
}
