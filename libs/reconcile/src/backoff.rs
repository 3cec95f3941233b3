//! Retry backoff and rate limiting.
//!
//! - [`BackoffPolicy`]: `min(base * 2^attempt, max)`, no jitter, so delays are
//!   non-decreasing in the attempt number.
//! - [`ItemExponentialLimiter`]: per-key failure counts driving a backoff policy.
//! - [`TokenBucketLimiter`]: overall qps/burst limit shared by all keys.
//! - [`MaxOfLimiter`]: the slowest of several limiters.
//!
//! The work queue consults a [`RateLimiter`] for `add_rate_limited`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay for the given zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Decides how long a key waits before it is re-added.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before the next attempt for `key`. Records the attempt.
    fn next_delay(&self, key: &K) -> Duration;

    /// Clear all retry state for `key`.
    fn reset(&self, key: &K);

    /// Number of times `key` has been rate limited since the last reset.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key exponential backoff.
///
/// Holds the retry state of every key that failed since its last reset.
#[derive(Debug)]
pub struct ItemExponentialLimiter<K> {
    policy: BackoffPolicy,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemExponentialLimiter<K> {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialLimiter<K> {
    fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = self.policy.delay(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn reset(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Overall token bucket: `qps` tokens per second, at most `burst` stored.
///
/// Every call reserves a token; when the bucket is empty the returned delay is
/// the time until the reserved token becomes available. Not per key.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    qps: f64,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl TokenBucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(f64::from(self.burst));
        bucket.last_refill = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }
}

impl<K> RateLimiter<K> for TokenBucketLimiter {
    fn next_delay(&self, _key: &K) -> Duration {
        self.reserve()
    }

    fn reset(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Returns the longest delay of its children.
pub struct MaxOfLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfLimiter<K> {
    fn next_delay(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.next_delay(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn reset(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.reset(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff combined with an overall token bucket.
pub fn default_controller_limiter<K>(
    policy: BackoffPolicy,
    qps: f64,
    burst: u32,
) -> MaxOfLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(policy)),
        Box::new(TokenBucketLimiter::new(qps, burst)),
    ])
}
