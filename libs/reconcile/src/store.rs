//! Local cache of the last observed state of every tracked resource.
//!
//! Snapshots are stored behind `Arc` and replaced wholesale on every write, so
//! readers only ever see a complete snapshot. Writes take the whole-store
//! lock; reads share it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::key::ObjectKey;
use crate::object::Resource;

/// A cached snapshot and its version token.
#[derive(Debug, Clone)]
pub struct CacheEntry<R> {
    pub snapshot: Arc<R>,
    pub resource_version: Option<String>,
}

/// Outcome of a [`Store::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was not cached before.
    Created,
    /// The entry was replaced with a different version.
    Updated,
    /// The entry was replaced but the version token is unchanged.
    Unchanged,
}

/// Thread-safe store of resource snapshots keyed by [`ObjectKey`].
#[derive(Debug)]
pub struct Store<R> {
    entries: RwLock<HashMap<ObjectKey, CacheEntry<R>>>,
}

impl<R: Resource> Default for Store<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> Store<R> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the current snapshot for a key.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<R>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|e| Arc::clone(&e.snapshot))
    }

    /// Get the full cache entry for a key.
    pub fn entry(&self, key: &ObjectKey) -> Option<CacheEntry<R>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).cloned()
    }

    /// Store a snapshot, replacing any previous entry.
    ///
    /// Always safe to call; the returned outcome tells the caller whether the
    /// version token changed.
    pub fn put(&self, key: ObjectKey, snapshot: R, resource_version: Option<String>) -> PutOutcome {
        let entry = CacheEntry {
            snapshot: Arc::new(snapshot),
            resource_version,
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.insert(key, entry.clone()) {
            None => PutOutcome::Created,
            Some(prev)
                if prev.resource_version.is_some()
                    && prev.resource_version == entry.resource_version =>
            {
                PutOutcome::Unchanged
            }
            Some(_) => PutOutcome::Updated,
        }
    }

    /// Remove a key. Returns the removed snapshot; absent keys are a no-op.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<R>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).map(|e| e.snapshot)
    }

    /// All cached keys, in key order.
    pub fn list_keys(&self) -> BTreeSet<ObjectKey> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.keys().cloned().collect()
    }

    /// All cached snapshots.
    pub fn list(&self) -> Vec<Arc<R>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().map(|e| Arc::clone(&e.snapshot)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
