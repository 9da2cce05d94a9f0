//! Rate limiters: decide how long a failed key waits before it is retried.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::Key;

/// Backoff policy consulted by [`WorkQueue::add_rate_limited`](super::WorkQueue::add_rate_limited).
pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may run again. Counts as one more failure of `key`.
    fn when(&self, key: &Key) -> Duration;

    /// Clear the failure history of `key` (call after a successful reconcile).
    fn forget(&self, key: &Key);

    /// How many times `key` has been requeued since it was last forgotten.
    fn num_requeues(&self, key: &Key) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
///
/// Example with base=5ms, max=1000s:
/// - 1st failure: 5ms
/// - 2nd failure: 10ms
/// - 3rd failure: 20ms
/// - ...
/// - from the 19th failure on: 1000s
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<Key, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn delay_for(&self, exponent: u32) -> Duration {
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &Key) -> Duration {
        let exponent = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(key.clone()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };
        self.delay_for(exponent)
    }

    fn forget(&self, key: &Key) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every key: bounds the overall retry rate.
///
/// Keys are not tracked, so `forget` does nothing.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &Key) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        // 1 トークンを予約する。足りなければ補充されるまでの時間を返す
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &Key) {}

    fn num_requeues(&self, _key: &Key) -> u32 {
        0
    }
}

/// Combines limiters: the longest delay wins.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &Key) -> Duration {
        // every limiter must see the failure, so no short-circuit here
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, key: &Key) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// The usual controller limiter: per-key exponential backoff (5ms .. 1000s)
/// combined with a 10 qps / 100 burst overall bucket.
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
