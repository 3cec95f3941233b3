//! Source backed by a directory of JSON manifests.
//!
//! Each `*.json` file holds one [`Object`]. Files without a resource version
//! get one derived from the spec hash, so editing a spec registers as a
//! change. Changes are detected by polling and diffing against the last
//! listing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use converge_reconcile::{Object, ObjectKey, Resource, Source, SourceError, WatchEvent, WatchStream};
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Snapshot = BTreeMap<ObjectKey, Object>;

/// Lists and polls a manifest directory.
#[derive(Debug)]
pub struct FileSource {
    dir: PathBuf,
    poll_interval: Duration,
    last_listed: Arc<Mutex<Snapshot>>,
}

/// Shortest poll interval; zero is raised to this.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

impl FileSource {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            last_listed: Arc::new(Mutex::new(Snapshot::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every manifest in the directory. Unreadable files are skipped.
    pub async fn scan(&self) -> Result<Snapshot, SourceError> {
        scan_dir(&self.dir).await
    }
}

async fn scan_dir(dir: &Path) -> Result<Snapshot, SourceError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SourceError::List(format!("{}: {e}", dir.display())))?;

    let mut snapshot = Snapshot::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(SourceError::List(format!("{}: {e}", dir.display()))),
        };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        match load_manifest(&path).await {
            Ok((key, obj)) => {
                if let Some(previous) = snapshot.insert(key.clone(), obj) {
                    warn!(%key, path = %path.display(), version = ?previous.resource_version(), "Duplicate manifest key, keeping last");
                }
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed manifest"),
        }
    }
    Ok(snapshot)
}

async fn load_manifest(path: &Path) -> Result<(ObjectKey, Object)> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let obj: Object = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let obj = obj.with_derived_version();
    let key = obj
        .key()
        .with_context(|| format!("invalid metadata in {}", path.display()))?;
    Ok((key, obj))
}

/// Notifications that turn `old` into `new`.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<WatchEvent<Object>> {
    let mut events = Vec::new();
    for (key, obj) in new {
        match old.get(key) {
            None => events.push(WatchEvent::Added(obj.clone())),
            Some(prev) if prev.resource_version() != obj.resource_version() => {
                events.push(WatchEvent::Modified(obj.clone()))
            }
            Some(_) => {}
        }
    }
    for (key, obj) in old {
        if !new.contains_key(key) {
            events.push(WatchEvent::Deleted(obj.clone()));
        }
    }
    events
}

#[async_trait]
impl Source<Object> for FileSource {
    async fn list(&self) -> Result<Vec<Object>, SourceError> {
        let snapshot = self.scan().await?;
        let objects = snapshot.values().cloned().collect();
        *self.last_listed.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(objects)
    }

    async fn watch(&self) -> Result<WatchStream<Object>, SourceError> {
        let baseline = self
            .last_listed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(poll(
            self.dir.clone(),
            self.poll_interval,
            baseline,
            Arc::clone(&self.last_listed),
            tx,
        ));

        Ok(stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
        .boxed())
    }
}

/// Poll the directory until the stream is dropped or a scan fails.
async fn poll(
    dir: PathBuf,
    interval: Duration,
    mut current: Snapshot,
    last_listed: Arc<Mutex<Snapshot>>,
    tx: mpsc::Sender<WatchEvent<Object>>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tx.closed() => break,
        }

        let next = match scan_dir(&dir).await {
            Ok(next) => next,
            Err(e) => {
                // Ending the stream makes the informer relist.
                warn!(error = %e, "Manifest scan failed, ending watch");
                break;
            }
        };

        for event in diff(&current, &next) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
        *last_listed.lock().unwrap_or_else(PoisonError::into_inner) = next.clone();
        current = next;
    }

    debug!(dir = %dir.display(), "Manifest poller stopped");
}
