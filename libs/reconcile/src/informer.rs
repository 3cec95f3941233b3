//! List-and-watch loop that keeps the cache current.
//!
//! The informer:
//! 1. Lists the source and replaces the cache contents (adds, updates, and
//!    deletions for cached keys missing from the list)
//! 2. Marks the cache synced
//! 3. Applies watch notifications through the event translator
//! 4. Relists with backoff whenever the watch stream ends or cannot be opened
//!
//! Notifications are pulled from the source's stream on the informer task,
//! so delivery never runs on a worker.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::backoff::BackoffPolicy;
use crate::error::SourceError;
use crate::key::ObjectKey;
use crate::object::Resource;
use crate::shutdown::{sleep_or_shutdown, wait_for_shutdown};
use crate::source::{Source, WatchEvent, WatchStream};
use crate::translator::EventTranslator;

/// Keeps a cache in sync with a source.
pub struct Informer<R> {
    source: Arc<dyn Source<R>>,
    translator: Arc<EventTranslator<R>>,
    relist_backoff: BackoffPolicy,
    synced: watch::Sender<bool>,
}

impl<R: Resource> Informer<R> {
    pub fn new(
        source: Arc<dyn Source<R>>,
        translator: Arc<EventTranslator<R>>,
        relist_backoff: BackoffPolicy,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            source,
            translator,
            relist_backoff,
            synced,
        }
    }

    /// Returns true once the first list has been applied.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Receiver that flips to `true` once the first list has been applied.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Resolves once the first list has been applied.
    pub async fn wait_synced(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives in `self`, so this cannot fail while borrowed.
        let _ = synced.wait_for(|done| *done).await;
    }

    /// List the source and make the cache match it.
    ///
    /// Returns the number of listed objects.
    pub async fn sync_once(&self) -> Result<usize, SourceError> {
        let listed = self.source.list().await?;
        let count = listed.len();
        let store = self.translator.store();

        let mut seen = HashSet::with_capacity(count);
        for obj in listed {
            if let Some(key) = self.upsert(obj, "list") {
                seen.insert(key);
            }
        }

        // Anything cached but no longer listed was deleted while unobserved.
        for key in store.list_keys() {
            if seen.contains(&key) {
                continue;
            }
            if let Some(last_known) = store.get(&key) {
                debug!(%key, "Cached key missing from list, treating as deleted");
                self.translator.on_delete(&last_known);
            }
        }

        self.synced.send_replace(true);
        Ok(count)
    }

    /// Initial sync followed by the watch loop.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), SourceError> {
        let count = self.sync_once().await?;
        info!(objects = count, "Cache synced");
        self.watch_loop(shutdown).await;
        Ok(())
    }

    /// Consume watch streams until shutdown, relisting between streams.
    ///
    /// Expects the cache to have been synced already.
    #[instrument(skip_all, name = "informer")]
    pub async fn watch_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;

        loop {
            match self.source.watch().await {
                Ok(stream) => {
                    failures = 0;
                    if self.consume(stream, &mut shutdown).await {
                        break;
                    }
                    warn!("Watch stream ended, relisting");
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, failures, "Failed to open watch");
                }
            }

            if self.relist(&mut failures, &mut shutdown).await {
                break;
            }
        }

        debug!("Informer stopped");
    }

    /// Apply events until the stream ends. Returns true on shutdown.
    async fn consume(
        &self,
        mut stream: WatchStream<R>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(event) => self.apply(event),
                    None => return false,
                },
                _ = wait_for_shutdown(shutdown) => return true,
            }
        }
    }

    /// Relist until it succeeds. Returns true on shutdown.
    async fn relist(&self, failures: &mut u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            let delay = self.relist_backoff.delay(*failures);
            if sleep_or_shutdown(delay, shutdown).await {
                return true;
            }

            match self.sync_once().await {
                Ok(count) => {
                    info!(objects = count, "Relisted source");
                    *failures = 0;
                    return false;
                }
                Err(e) => {
                    *failures = failures.saturating_add(1);
                    warn!(error = %e, failures = *failures, "Relist failed");
                }
            }
        }
    }

    fn apply(&self, event: WatchEvent<R>) {
        match event {
            WatchEvent::Added(obj) => {
                self.upsert(obj, "add");
            }
            WatchEvent::Modified(obj) => {
                self.upsert(obj, "update");
            }
            WatchEvent::Deleted(obj) => {
                self.translator.on_delete(&obj);
            }
        }
    }

    /// Route an observed object to add or update depending on the cache.
    /// `event` names the notification kind for malformed-object logs.
    fn upsert(&self, obj: R, event: &'static str) -> Option<ObjectKey> {
        let key = self.translator.key_of(&obj, event)?;
        match self.translator.store().get(&key) {
            Some(old) => self.translator.on_update(&old, obj),
            None => self.translator.on_add(obj),
        };
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::stream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::backoff::ItemExponentialLimiter;
    use crate::object::Object;
    use crate::observe::ControllerStats;
    use crate::queue::WorkQueue;
    use crate::store::Store;
    use crate::test_support::capture_logs;
    use crate::translator::UpdateFilter;

    /// Source whose list results and watch streams are scripted by the test.
    struct ScriptedSource {
        lists: Mutex<Vec<Result<Vec<Object>, SourceError>>>,
        watches: Mutex<Vec<mpsc::UnboundedReceiver<WatchEvent<Object>>>>,
    }

    #[async_trait]
    impl Source<Object> for ScriptedSource {
        async fn list(&self) -> Result<Vec<Object>, SourceError> {
            let mut lists = self.lists.lock().unwrap();
            if lists.is_empty() {
                return Ok(Vec::new());
            }
            lists.remove(0)
        }

        async fn watch(&self) -> Result<WatchStream<Object>, SourceError> {
            let mut watches = self.watches.lock().unwrap();
            if watches.is_empty() {
                return Ok(stream::pending().boxed());
            }
            let rx = watches.remove(0);
            Ok(stream::unfold(rx, |mut rx| async move {
                let event = rx.recv().await?;
                Some((event, rx))
            })
            .boxed())
        }
    }

    fn obj(name: &str, version: &str) -> Object {
        Object::new("default", name, version, serde_json::json!({}))
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    fn setup(
        lists: Vec<Result<Vec<Object>, SourceError>>,
        watches: Vec<mpsc::UnboundedReceiver<WatchEvent<Object>>>,
    ) -> (Informer<Object>, Arc<WorkQueue<ObjectKey>>, Arc<Store<Object>>) {
        let queue = Arc::new(WorkQueue::new(
            "informer-test",
            ItemExponentialLimiter::new(BackoffPolicy::default()),
        ));
        let store = Arc::new(Store::new());
        let translator = Arc::new(EventTranslator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            UpdateFilter::default(),
            Arc::new(ControllerStats::default()),
        ));
        let source = Arc::new(ScriptedSource {
            lists: Mutex::new(lists),
            watches: Mutex::new(watches),
        });
        let informer = Informer::new(
            source,
            translator,
            BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
        );
        (informer, queue, store)
    }

    async fn drain(queue: &WorkQueue<ObjectKey>) -> Vec<String> {
        let mut keys = Vec::new();
        while !queue.is_empty() {
            let k = queue.get().await.unwrap();
            queue.done(&k);
            keys.push(k.to_string());
        }
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_initial_sync_primes_cache_and_enqueues() {
        let (informer, queue, store) = setup(vec![Ok(vec![obj("a", "1"), obj("b", "1")])], vec![]);
        assert!(!informer.has_synced());

        assert_eq!(informer.sync_once().await.unwrap(), 2);
        assert!(informer.has_synced());
        informer.wait_synced().await;
        assert_eq!(store.len(), 2);
        assert_eq!(drain(&queue).await, vec!["default/a", "default/b"]);
    }

    #[tokio::test]
    async fn test_initial_list_failure_is_reported() {
        let (informer, _queue, _store) = setup(vec![Err(SourceError::List("refused".into()))], vec![]);
        let (_tx, rx) = watch::channel(false);
        assert!(informer.run(rx).await.is_err());
        assert!(!informer.has_synced());
    }

    #[tokio::test]
    async fn test_relist_replaces_cache_with_tombstones() {
        let (informer, queue, store) = setup(
            vec![
                Ok(vec![obj("a", "1"), obj("b", "1")]),
                Ok(vec![obj("a", "1"), obj("c", "1")]),
            ],
            vec![],
        );
        informer.sync_once().await.unwrap();
        drain(&queue).await;

        informer.sync_once().await.unwrap();
        assert!(store.get(&key("b")).is_none());
        assert!(store.get(&key("c")).is_some());
        // "a" is unchanged, so only the delete and the add are enqueued.
        assert_eq!(drain(&queue).await, vec!["default/b", "default/c"]);
    }

    #[tokio::test]
    async fn test_watch_events_flow_into_cache() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (informer, queue, store) = setup(vec![Ok(vec![obj("a", "1")])], vec![rx]);
        informer.sync_once().await.unwrap();
        drain(&queue).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let informer = Arc::new(informer);
        let handle = tokio::spawn({
            let informer = Arc::clone(&informer);
            async move { informer.watch_loop(shutdown_rx).await }
        });

        tx.send(WatchEvent::Modified(obj("a", "2"))).unwrap();
        tx.send(WatchEvent::Added(obj("b", "1"))).unwrap();
        tx.send(WatchEvent::Modified(obj("b", "1"))).unwrap();
        tx.send(WatchEvent::Deleted(obj("a", "2"))).unwrap();

        while store.get(&key("b")).is_none() || store.get(&key("a")).is_some() {
            tokio::task::yield_now().await;
        }
        assert_eq!(drain(&queue).await, vec!["default/a", "default/b"]);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_triggers_relist() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (informer, queue, store) = setup(
            vec![Ok(vec![obj("a", "1")]), Ok(vec![obj("z", "1")])],
            vec![rx],
        );
        informer.sync_once().await.unwrap();
        drain(&queue).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let informer = Arc::new(informer);
        let handle = tokio::spawn({
            let informer = Arc::clone(&informer);
            async move { informer.watch_loop(shutdown_rx).await }
        });

        // Close the stream: the informer relists and picks up the new state.
        drop(tx);
        while store.get(&key("z")).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.get(&key("a")).is_none());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_modified_logged_as_update() {
        let (informer, queue, store) = setup(vec![Ok(vec![])], vec![]);
        informer.sync_once().await.unwrap();

        let output = capture_logs(|| {
            informer.apply(WatchEvent::Modified(obj("", "2")));
        });

        assert!(output.contains("Dropping malformed notification"));
        assert!(output.contains("event=\"update\""), "{output}");
        assert!(store.is_empty());
        assert!(queue.is_empty());
    }
}
