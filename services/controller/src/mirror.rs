//! Reconciler that mirrors each object into a file.
//!
//! `reconcile` writes `<output>/<namespace>_<name>.json` when its content
//! differs from the object; `cleanup` removes it. Both are idempotent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use converge_reconcile::{Action, Object, ObjectKey, ReconcileContext, ReconcileResult, Reconciler};
use tracing::{debug, info};

/// Mirrors objects into an output directory.
#[derive(Debug, Clone)]
pub struct MirrorReconciler {
    output_dir: PathBuf,
}

impl MirrorReconciler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// File an object's mirror lives in.
    pub fn path_for(&self, key: &ObjectKey) -> PathBuf {
        let file = match key.namespace() {
            Some(namespace) => format!("{namespace}_{}.json", key.name()),
            None => format!("{}.json", key.name()),
        };
        self.output_dir.join(file)
    }
}

#[async_trait]
impl Reconciler<Object> for MirrorReconciler {
    async fn reconcile(&self, obj: Arc<Object>, ctx: &ReconcileContext) -> ReconcileResult<Action> {
        let path = self.path_for(ctx.key());
        let desired = serde_json::to_vec_pretty(obj.as_ref()).context("failed to render object")?;

        match tokio::fs::read(&path).await {
            Ok(current) if current == desired => {
                debug!(key = %ctx.key(), "Mirror already up to date");
                return Ok(Action::done());
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read {}", path.display()))
                    .into())
            }
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("failed to create {}", self.output_dir.display()))?;

        // Write then rename so readers never see a partial file.
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, &desired)
            .await
            .with_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &path)
            .await
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        info!(key = %ctx.key(), path = %path.display(), "Mirror written");
        Ok(Action::done())
    }

    async fn cleanup(&self, key: &ObjectKey, _ctx: &ReconcileContext) -> ReconcileResult<Action> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(%key, path = %path.display(), "Mirror removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(%key, "Mirror already absent");
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to remove {}", path.display()))
                    .into())
            }
        }
        Ok(Action::done())
    }
}
