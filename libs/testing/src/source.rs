use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use converge_reconcile::{Object, ObjectKey, Resource, Source, SourceError, WatchEvent, WatchStream};
use futures_util::{stream, StreamExt};
use tokio::sync::mpsc;

/// In-memory source.
///
/// Every mutation assigns a fresh, increasing resource version. The
/// `*_silently` variants change the listed state without notifying open
/// watches, which models missed notifications.
#[derive(Default)]
pub struct FakeSource {
    objects: Mutex<BTreeMap<ObjectKey, Object>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<WatchEvent<Object>>>>,
    version: AtomicU64,
    failing_lists: AtomicU32,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source pre-populated with `objects`.
    pub fn with_objects(objects: impl IntoIterator<Item = Object>) -> Self {
        let source = Self::new();
        for obj in objects {
            source.upsert_silently(obj);
        }
        source
    }

    /// Create or update an object and notify watchers.
    pub fn upsert(&self, obj: Object) -> Object {
        let (stored, existed) = self.store(obj);
        let event = if existed {
            WatchEvent::Modified(stored.clone())
        } else {
            WatchEvent::Added(stored.clone())
        };
        self.broadcast(event);
        stored
    }

    /// Create or update an object without notifying watchers.
    pub fn upsert_silently(&self, obj: Object) -> Object {
        self.store(obj).0
    }

    /// Delete an object and notify watchers with its last known state.
    pub fn delete(&self, key: &ObjectKey) -> Option<Object> {
        let removed = self.objects().remove(key);
        if let Some(obj) = &removed {
            self.broadcast(WatchEvent::Deleted(obj.clone()));
        }
        removed
    }

    /// Delete an object without notifying watchers.
    pub fn delete_silently(&self, key: &ObjectKey) -> Option<Object> {
        self.objects().remove(key)
    }

    /// Send a raw notification to every open watch.
    pub fn send(&self, event: WatchEvent<Object>) {
        self.broadcast(event);
    }

    /// Make the next `n` list calls fail.
    pub fn fail_next_lists(&self, n: u32) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    /// End every open watch stream.
    pub fn close_watches(&self) {
        self.watchers().clear();
    }

    /// Number of watch streams still open.
    pub fn open_watches(&self) -> usize {
        let mut watchers = self.watchers();
        watchers.retain(|tx| !tx.is_closed());
        watchers.len()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Current state of an object.
    pub fn get(&self, key: &ObjectKey) -> Option<Object> {
        self.objects().get(key).cloned()
    }

    fn store(&self, mut obj: Object) -> (Object, bool) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(version.to_string());
        let key = match obj.key() {
            Ok(key) => key,
            // Unkeyable objects are kept out of the listing but still notified.
            Err(_) => return (obj, false),
        };
        let existed = self.objects().insert(key, obj.clone()).is_some();
        (obj, existed)
    }

    fn broadcast(&self, event: WatchEvent<Object>) {
        self.watchers().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<ObjectKey, Object>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<WatchEvent<Object>>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Source<Object> for FakeSource {
    async fn list(&self) -> Result<Vec<Object>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SourceError::List("injected list failure".to_string()));
        }
        Ok(self.objects().values().cloned().collect())
    }

    async fn watch(&self) -> Result<WatchStream<Object>, SourceError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers().push(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
        .boxed())
    }
}
