//! Translates source notifications into cache writes and queue keys.
//!
//! Adds and deletes always enqueue. Updates enqueue only when the
//! [`UpdateFilter`] reports an observable change; the cache is written either
//! way. A notification whose object has no valid key is logged and dropped.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::key::ObjectKey;
use crate::object::Resource;
use crate::observe::ControllerStats;
use crate::queue::WorkQueue;
use crate::store::Store;

type Predicate<R> = Arc<dyn Fn(&R, &R) -> bool + Send + Sync>;

/// Decides whether an update carries a change worth reconciling.
pub enum UpdateFilter<R> {
    /// Enqueue when the version tokens differ, or either side has none.
    ResourceVersionChanged,
    /// Enqueue every update.
    Always,
    /// Enqueue when the predicate returns true for `(old, new)`.
    Custom(Predicate<R>),
}

impl<R: Resource> UpdateFilter<R> {
    /// Filter with a custom `(old, new) -> changed` predicate.
    pub fn custom(predicate: impl Fn(&R, &R) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    pub fn is_changed(&self, old: &R, new: &R) -> bool {
        match self {
            Self::ResourceVersionChanged => match (old.resource_version(), new.resource_version()) {
                (Some(a), Some(b)) => a != b,
                _ => true,
            },
            Self::Always => true,
            Self::Custom(predicate) => predicate(old, new),
        }
    }
}

impl<R: Resource + PartialEq> UpdateFilter<R> {
    /// Enqueue whenever the snapshots differ in any field.
    pub fn full_equality() -> Self {
        Self::custom(|old: &R, new: &R| old != new)
    }
}

impl<R> Default for UpdateFilter<R> {
    fn default() -> Self {
        Self::ResourceVersionChanged
    }
}

impl<R> Clone for UpdateFilter<R> {
    fn clone(&self) -> Self {
        match self {
            Self::ResourceVersionChanged => Self::ResourceVersionChanged,
            Self::Always => Self::Always,
            Self::Custom(predicate) => Self::Custom(Arc::clone(predicate)),
        }
    }
}

impl<R> fmt::Debug for UpdateFilter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceVersionChanged => f.write_str("ResourceVersionChanged"),
            Self::Always => f.write_str("Always"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Applies notifications to the cache and enqueues affected keys.
pub struct EventTranslator<R> {
    store: Arc<Store<R>>,
    queue: Arc<WorkQueue<ObjectKey>>,
    filter: UpdateFilter<R>,
    stats: Arc<ControllerStats>,
}

impl<R: Resource> EventTranslator<R> {
    pub fn new(
        store: Arc<Store<R>>,
        queue: Arc<WorkQueue<ObjectKey>>,
        filter: UpdateFilter<R>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        Self {
            store,
            queue,
            filter,
            stats,
        }
    }

    /// A resource appeared. Returns true if its key was enqueued.
    pub fn on_add(&self, obj: R) -> bool {
        let Some(key) = self.key_of(&obj, "add") else {
            return false;
        };
        let version = obj.resource_version().map(str::to_string);
        self.store.put(key.clone(), obj, version);
        self.queue.add(key);
        true
    }

    /// A resource changed from `old` to `new`. Returns true if its key was
    /// enqueued.
    pub fn on_update(&self, old: &R, new: R) -> bool {
        let Some(key) = self.key_of(&new, "update") else {
            return false;
        };
        let changed = self.filter.is_changed(old, &new);
        let version = new.resource_version().map(str::to_string);
        self.store.put(key.clone(), new, version);

        if changed {
            self.queue.add(key);
        } else {
            trace!(%key, "Update carries no change, not enqueueing");
        }
        changed
    }

    /// A resource was deleted. `obj` is its last known state.
    pub fn on_delete(&self, obj: &R) -> bool {
        let Some(key) = self.key_of(obj, "delete") else {
            return false;
        };
        self.store.delete(&key);
        self.queue.add(key);
        true
    }

    /// Enqueue a key directly, bypassing the cache.
    pub fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    pub fn store(&self) -> &Arc<Store<R>> {
        &self.store
    }

    /// Key of `obj`, or `None` after counting and logging it as malformed
    /// under the notification kind `event`.
    pub(crate) fn key_of(&self, obj: &R, event: &'static str) -> Option<ObjectKey> {
        match obj.key() {
            Ok(key) => Some(key),
            Err(e) => {
                self.stats.malformed_events.fetch_add(1, Ordering::Relaxed);
                warn!(event, error = %e, "Dropping malformed notification");
                None
            }
        }
    }
}
