//! Deduplicating, rate-limited work queue.
//!
//! The queue is the single arbiter of the at-most-one-in-flight guarantee:
//!
//! - a key is *dirty* while it waits to be handed out,
//! - a key is *processing* between [`WorkQueue::get`] and [`WorkQueue::done`].
//!
//! Adding a dirty key is a no-op. Adding a processing key marks it dirty
//! without queueing it; `done` then puts it back on the ready list, so a
//! change that arrives mid-reconcile is processed exactly once more and never
//! concurrently with the reconcile in flight.
//!
//! Delayed adds wait in a deadline-ordered heap and are promoted to the ready
//! list by `get` once due. There is no background task.
//!
//! ```text
//! add ──► ready ──get──► processing ──done──► (dirty? ready : idle)
//!  ▲                         │
//!  └── add_after ◄── heap ◄──┘ add_rate_limited
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::backoff::RateLimiter;

/// Bounds required of queue keys.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for T {}

/// Longest delay `add_after` honors; longer delays are clamped to it.
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// An entry waiting in the delay heap.
#[derive(Debug)]
struct Delayed<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

#[derive(Debug)]
struct State<K> {
    /// Keys ready to be handed out, roughly FIFO.
    ready: VecDeque<K>,

    /// Keys that need processing (queued, or queued-again while processing).
    dirty: HashSet<K>,

    /// Keys handed out and not yet done.
    processing: HashSet<K>,

    /// Delayed adds, earliest deadline first.
    waiting: BinaryHeap<Reverse<Delayed<K>>>,

    /// Current deadline of each delayed key; stale heap entries are skipped.
    deadlines: HashMap<K, Instant>,

    seq: u64,

    shutting_down: bool,
}

impl<K: QueueKey> State<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BinaryHeap::new(),
            deadlines: HashMap::new(),
            seq: 0,
            shutting_down: false,
        }
    }

    /// Mark a key dirty. Returns true if the key was put on the ready list.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn schedule(&mut self, key: K, ready_at: Instant) -> bool {
        if let Some(existing) = self.deadlines.get(&key) {
            if *existing <= ready_at {
                return false;
            }
        }
        self.deadlines.insert(key.clone(), ready_at);
        self.seq = self.seq.wrapping_add(1);
        self.waiting.push(Reverse(Delayed {
            ready_at,
            seq: self.seq,
            key,
        }));
        true
    }

    /// Move every delayed key whose deadline has passed to the ready list.
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(head)) = self.waiting.peek() {
            if head.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.waiting.pop() else {
                break;
            };
            if self.deadlines.get(&entry.key) != Some(&entry.ready_at) {
                continue;
            }
            self.deadlines.remove(&entry.key);
            self.insert(entry.key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse(head)| head.ready_at)
    }
}

/// A deduplicating, rate-limited work queue of keys.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue that uses `limiter` for `add_rate_limited`.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            limiter: Box::new(limiter),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a key for processing. No-op if it is already queued or the
    /// queue is shutting down.
    pub fn add(&self, key: K) {
        let queued = {
            let mut state = self.lock();
            if state.shutting_down {
                trace!(queue = %self.name, key = ?key, "Ignoring add after shutdown");
                return;
            }
            state.insert(key)
        };
        if queued {
            self.notify.notify_one();
        }
    }

    /// Queue a key once `delay` has elapsed. If the key is already waiting,
    /// the earlier deadline wins. Delays beyond [`MAX_SCHEDULE_DELAY`] are
    /// clamped.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let scheduled = {
            let mut state = self.lock();
            if state.shutting_down {
                trace!(queue = %self.name, key = ?key, "Ignoring delayed add after shutdown");
                return;
            }
            let delay = delay.min(MAX_SCHEDULE_DELAY);
            state.schedule(key, Instant::now() + delay)
        };
        if scheduled {
            // A sleeping getter may need an earlier wake-up.
            self.notify.notify_one();
        }
    }

    /// Queue a key after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, key: K) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.limiter.next_delay(&key);
        trace!(
            queue = %self.name,
            key = ?key,
            ?delay,
            "Rate limited add"
        );
        self.add_after(key, delay);
    }

    /// Clear the rate limiter's retry state for a key.
    pub fn forget(&self, key: &K) {
        self.limiter.reset(key);
    }

    /// Times the key has been rate limited since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next ready key and mark it processing.
    ///
    /// Returns `None` once the queue is shut down and no ready keys remain.
    /// Every key returned must be passed to [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so no wake-up is missed.
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key as processed. If it was re-added while processing, it is
    /// queued again.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stop accepting new keys. Ready keys are still handed out; delayed keys
    /// are discarded. Blocked getters return once the ready list is empty.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.deadlines.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently being processed.
    pub fn processing_len(&self) -> usize {
        self.lock().processing.len()
    }

    /// Number of keys waiting for a delayed add.
    pub fn waiting_len(&self) -> usize {
        self.lock().deadlines.len()
    }
}

impl<K> Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.name).finish()
    }
}
