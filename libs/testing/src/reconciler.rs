use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use converge_reconcile::{
    Action, Object, ObjectKey, ReconcileContext, ReconcileError, ReconcileResult, Reconciler,
    Resource,
};
use tokio::sync::{watch, Semaphore};

/// What a scripted reconcile attempt does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Requeue,
    RequeueAfter(Duration),
    Transient,
    Permanent,
    NotFound,
    Panic,
}

impl Behavior {
    fn into_result(self, key: &ObjectKey) -> ReconcileResult<Action> {
        match self {
            Self::Succeed => Ok(Action::done()),
            Self::Requeue => Ok(Action::requeue()),
            Self::RequeueAfter(delay) => Ok(Action::requeue_after(delay)),
            Self::Transient => Err(ReconcileError::Transient(format!("{key} unavailable"))),
            Self::Permanent => Err(ReconcileError::Permanent(format!("{key} is invalid"))),
            Self::NotFound => Err(ReconcileError::NotFound(key.to_string())),
            Self::Panic => panic!("scripted panic for {key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Reconcile,
    Cleanup,
}

/// One recorded reconciler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub key: ObjectKey,
    pub kind: CallKind,
    pub retry_count: u32,
    /// Version of the cached object handed to `reconcile`.
    pub version: Option<String>,
}

/// Holds reconcile attempts for one key until released.
#[derive(Debug)]
pub struct Gate {
    entered: watch::Sender<usize>,
    release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        let (entered, _) = watch::channel(0);
        Self {
            entered,
            release: Semaphore::new(0),
        }
    }

    /// Wait until at least `n` attempts have reached the gate.
    pub async fn wait_entered(&self, n: usize) {
        let mut entered = self.entered.subscribe();
        let _ = entered.wait_for(|count| *count >= n).await;
    }

    /// Let one held attempt through.
    pub fn release_one(&self) {
        self.release.add_permits(1);
    }

    /// Let every current and future attempt through.
    pub fn open(&self) {
        self.release.close();
    }

    async fn pass(&self) {
        self.entered.send_modify(|count| *count += 1);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

/// Reconciler that records calls and replays scripted behaviors.
///
/// Keys without a script succeed. A key's script is consumed one step per
/// attempt; once empty, the key's fallback behavior applies.
#[derive(Default)]
pub struct RecordingReconciler {
    calls: Mutex<Vec<Call>>,
    scripts: Mutex<HashMap<ObjectKey, VecDeque<Behavior>>>,
    fallbacks: Mutex<HashMap<ObjectKey, Behavior>>,
    gates: Mutex<HashMap<ObjectKey, Arc<Gate>>>,
    in_flight: Mutex<HashSet<ObjectKey>>,
    overlaps: AtomicUsize,
    max_concurrency: AtomicUsize,
    work: Option<Duration>,
}

impl RecordingReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `work` before returning.
    pub fn with_work(work: Duration) -> Self {
        Self {
            work: Some(work),
            ..Self::default()
        }
    }

    /// Queue one-shot behaviors for a key.
    pub fn script(&self, key: &ObjectKey, steps: impl IntoIterator<Item = Behavior>) {
        lock(&self.scripts)
            .entry(key.clone())
            .or_default()
            .extend(steps);
    }

    /// Behavior once the key's script is exhausted.
    pub fn fallback(&self, key: &ObjectKey, behavior: Behavior) {
        lock(&self.fallbacks).insert(key.clone(), behavior);
    }

    /// Hold every attempt for `key` at a gate until released.
    pub fn gate(&self, key: &ObjectKey) -> Arc<Gate> {
        Arc::clone(
            lock(&self.gates)
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Gate::new())),
        )
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, key: &ObjectKey) -> Vec<Call> {
        lock(&self.calls)
            .iter()
            .filter(|call| &call.key == key)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, key: &ObjectKey) -> usize {
        lock(&self.calls).iter().filter(|call| &call.key == key).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Times a call started while another call for the same key was running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once, across keys.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.load(Ordering::SeqCst)
    }

    async fn attempt(
        &self,
        key: &ObjectKey,
        kind: CallKind,
        version: Option<String>,
        ctx: &ReconcileContext,
    ) -> ReconcileResult<Action> {
        lock(&self.calls).push(Call {
            key: key.clone(),
            kind,
            retry_count: ctx.retry_count(),
            version,
        });

        let _in_flight = InFlight::enter(self, key);

        let gate = lock(&self.gates).get(key).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(work) = self.work {
            tokio::time::sleep(work).await;
        }

        self.next_behavior(key).into_result(key)
    }

    fn next_behavior(&self, key: &ObjectKey) -> Behavior {
        let scripted = lock(&self.scripts)
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| lock(&self.fallbacks).get(key).cloned())
            .unwrap_or(Behavior::Succeed)
    }
}

/// Tracks a running call; removed on drop so panics are accounted for.
struct InFlight<'a> {
    owner: &'a RecordingReconciler,
    key: ObjectKey,
}

impl<'a> InFlight<'a> {
    fn enter(owner: &'a RecordingReconciler, key: &ObjectKey) -> Self {
        let mut in_flight = lock(&owner.in_flight);
        if !in_flight.insert(key.clone()) {
            owner.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        owner
            .max_concurrency
            .fetch_max(in_flight.len(), Ordering::SeqCst);
        Self {
            owner,
            key: key.clone(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(&self.owner.in_flight).remove(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Reconciler<Object> for RecordingReconciler {
    async fn reconcile(&self, obj: Arc<Object>, ctx: &ReconcileContext) -> ReconcileResult<Action> {
        let version = obj.resource_version().map(str::to_string);
        self.attempt(ctx.key(), CallKind::Reconcile, version, ctx).await
    }

    async fn cleanup(&self, key: &ObjectKey, ctx: &ReconcileContext) -> ReconcileResult<Action> {
        self.attempt(key, CallKind::Cleanup, None, ctx).await
    }
}
