use std::sync::{Mutex, MutexGuard, PoisonError};

use converge_reconcile::{ObjectKey, Outcome, ReconcileObserver, ReconcileRecord};

/// Collects every reconcile record.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    records: Mutex<Vec<ReconcileRecord>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ReconcileRecord> {
        self.lock().clone()
    }

    pub fn for_key(&self, key: &ObjectKey) -> Vec<ReconcileRecord> {
        self.lock()
            .iter()
            .filter(|record| &record.key == key)
            .cloned()
            .collect()
    }

    pub fn outcomes(&self, key: &ObjectKey) -> Vec<Outcome> {
        self.for_key(key).into_iter().map(|record| record.outcome).collect()
    }

    /// Keys that were given up on.
    pub fn dropped(&self) -> Vec<ObjectKey> {
        self.lock()
            .iter()
            .filter(|record| record.outcome.is_dropped())
            .map(|record| record.key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ReconcileRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReconcileObserver for RecordingObserver {
    fn observe(&self, record: &ReconcileRecord) {
        self.lock().push(record.clone());
    }
}
