//! Sliding-window rate limiter shared by concurrent dispatch tasks.
//!
//! Each bucket keeps a log of granted slots. A new caller is given the earliest slot that
//! keeps at most `rate` slots inside any window of length `period`; slots may lie in the
//! future, in which case the caller sleeps until its slot. Callers whose slot is further
//! away than `max_delay` are refused without reserving anything.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

const SHARED_BUCKET: &str = "*";
/// Bucket count above which idle per-key buckets are swept.
const SWEEP_THRESHOLD: usize = 1024;

/// A grant stops counting once its window has passed. Grants whose window end is not
/// representable never expire.
fn expired(granted: Instant, period: Duration, now: Instant) -> bool {
    granted.checked_add(period).is_some_and(|end| end <= now)
}

/// Whether the rate is enforced globally or per acquisition key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BucketScope {
    #[default]
    Shared,
    PerKey,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub rate: u32,
    pub period: Duration,
    pub max_delay: Duration,
    pub scope: BucketScope,
}

impl RateLimitConfig {
    pub fn new(rate: u32, period: Duration, max_delay: Duration) -> Self {
        Self {
            rate,
            period,
            max_delay,
            scope: BucketScope::Shared,
        }
    }

    pub fn with_scope(mut self, scope: BucketScope) -> Self {
        self.scope = scope;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {key}: next slot in {wait:?}")]
    RateExceeded { key: String, wait: Duration },
}

/// Cheap to clone; clones share buckets.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn bucket_key<'a>(&self, key: &'a str) -> &'a str {
        match self.config.scope {
            BucketScope::Shared => SHARED_BUCKET,
            BucketScope::PerKey => key,
        }
    }

    /// Reserve the next slot for `key` as seen at `now`. Returns how long the caller must
    /// wait before its slot starts.
    pub fn reserve_at(&self, key: &str, now: Instant) -> Result<Duration, RateLimitError> {
        let bucket_key = self.bucket_key(key);
        let rate = self.config.rate as usize;
        let period = self.config.period;
        let exceeded = |wait| RateLimitError::RateExceeded {
            key: bucket_key.to_string(),
            wait,
        };

        // The log stays consistent even if a holder panicked mid-update.
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if buckets.len() >= SWEEP_THRESHOLD {
            buckets.retain(|_, log| log.back().is_some_and(|last| !expired(*last, period, now)));
        }
        let log = buckets.entry(bucket_key.to_string()).or_default();
        while log.front().is_some_and(|granted| expired(*granted, period, now)) {
            log.pop_front();
        }

        let last = log.back().copied().unwrap_or(now).max(now);
        let slot = if log.len() < rate {
            Some(last)
        } else if rate == 0 {
            None
        } else {
            log[log.len() - rate]
                .checked_add(period)
                .map(|freed| freed.max(last))
        };

        let decision = match slot {
            None => Err(exceeded(Duration::MAX)),
            Some(slot) => {
                let wait = slot.saturating_duration_since(now);
                if wait > self.config.max_delay {
                    Err(exceeded(wait))
                } else {
                    log.push_back(slot);
                    Ok(wait)
                }
            }
        };
        if log.is_empty() {
            buckets.remove(bucket_key);
        }
        if let Err(RateLimitError::RateExceeded { wait, .. }) = &decision {
            debug!(key = bucket_key, ?wait, max_delay = ?self.config.max_delay, "rate limit denied");
        }
        decision
    }

    /// Acquire one permit, sleeping until the reserved slot if needed.
    /// Returns the time spent waiting.
    pub async fn try_acquire(&self, key: &str) -> Result<Duration, RateLimitError> {
        let now = Instant::now();
        let wait = self.reserve_at(key, now)?;
        if !wait.is_zero() {
            tokio::time::sleep_until(now + wait).await;
        }
        Ok(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u32, period_secs: u64, max_delay_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(
            rate,
            Duration::from_secs(period_secs),
            Duration::from_secs(max_delay_secs),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_limiter_with_zero_delay_fails_immediately() {
        let limiter = limiter(3, 60, 0);
        for _ in 0..3 {
            assert_eq!(limiter.try_acquire("a").await, Ok(Duration::ZERO));
        }
        let err = limiter.try_acquire("a").await.unwrap_err();
        let RateLimitError::RateExceeded { wait, .. } = err;
        assert_eq!(wait, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn window_frees_permits_after_period() {
        let limiter = limiter(2, 10, 0);
        limiter.try_acquire("a").await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        limiter.try_acquire("a").await.unwrap();
        assert!(limiter.try_acquire("a").await.is_err());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.try_acquire("a").await.is_ok());
        assert!(limiter.try_acquire("a").await.is_err());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.try_acquire("a").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn caller_waits_for_slot_within_max_delay() {
        let limiter = limiter(1, 10, 30);
        let start = Instant::now();
        assert_eq!(limiter.try_acquire("a").await, Ok(Duration::ZERO));
        assert_eq!(limiter.try_acquire("a").await, Ok(Duration::from_secs(10)));
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_queue_up_until_max_delay() {
        let limiter = limiter(1, 10, 25);
        let now = Instant::now();
        assert_eq!(limiter.reserve_at("a", now), Ok(Duration::ZERO));
        assert_eq!(limiter.reserve_at("a", now), Ok(Duration::from_secs(10)));
        assert_eq!(limiter.reserve_at("a", now), Ok(Duration::from_secs(20)));
        assert!(limiter.reserve_at("a", now).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn no_window_ever_holds_more_than_rate_grants() {
        let limiter = limiter(5, 10, 40);
        let start = Instant::now();
        let mut slots = Vec::new();
        for _ in 0..40 {
            let now = Instant::now();
            if let Ok(wait) = limiter.reserve_at("a", now) {
                slots.push(now + wait - start);
            }
            tokio::time::advance(Duration::from_millis(700)).await;
        }
        assert!(slots.len() > 5);
        assert!(busiest_window(&mut slots, Duration::from_secs(10)) <= 5);
    }

    /// Largest number of slots inside any half-open window of length `period`.
    fn busiest_window(slots: &mut [Duration], period: Duration) -> usize {
        slots.sort();
        (0..slots.len())
            .map(|i| slots[i..].iter().filter(|s| **s < slots[i] + period).count())
            .max()
            .unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn refilling_token_bucket_would_overshoot_the_window() {
        // Burst of `rate`, then one caller per emission interval.
        let (rate, period) = (5u32, Duration::from_secs(10));
        let interval = period / rate;
        let arrivals: Vec<Duration> = (0..rate)
            .map(|_| Duration::ZERO)
            .chain((1..rate).map(|k| interval * k))
            .collect();

        // GCRA admits every arrival: the burst spends the tolerance, each later caller
        // arrives exactly when one token has been replenished.
        let mut gcra_slots = arrivals.clone();
        assert_eq!(busiest_window(&mut gcra_slots, period), 2 * rate as usize - 1);

        let limiter = limiter(rate, 10, 0);
        let start = Instant::now();
        let mut granted = Vec::new();
        for at in arrivals {
            tokio::time::advance((start + at).saturating_duration_since(Instant::now())).await;
            if limiter.reserve_at("a", Instant::now()).is_ok() {
                granted.push(at);
            }
        }
        assert_eq!(granted.len(), rate as usize);
        assert!(busiest_window(&mut granted, period) <= rate as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_period_refuses_instead_of_overflowing() {
        let limiter = RateLimiter::new(RateLimitConfig::new(
            1,
            Duration::from_secs(u64::MAX),
            Duration::ZERO,
        ));
        assert_eq!(limiter.try_acquire("a").await, Ok(Duration::ZERO));
        let err = limiter.try_acquire("a").await.unwrap_err();
        assert_eq!(
            err,
            RateLimitError::RateExceeded {
                key: SHARED_BUCKET.into(),
                wait: Duration::MAX,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_per_key_buckets_are_dropped() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new(1, Duration::from_secs(10), Duration::ZERO)
                .with_scope(BucketScope::PerKey),
        );
        for i in 0..SWEEP_THRESHOLD {
            limiter.try_acquire(&format!("caller-{i}")).await.unwrap();
        }
        assert_eq!(limiter.buckets.lock().unwrap().len(), SWEEP_THRESHOLD);

        tokio::time::advance(Duration::from_secs(10)).await;
        limiter.try_acquire("late").await.unwrap();
        assert_eq!(limiter.buckets.lock().unwrap().len(), 1);

        // A refused caller with nothing granted leaves no bucket behind.
        let closed = RateLimiter::new(
            RateLimitConfig::new(0, Duration::from_secs(10), Duration::ZERO)
                .with_scope(BucketScope::PerKey),
        );
        assert!(closed.try_acquire("nobody").await.is_err());
        assert!(closed.buckets.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn per_key_buckets_are_independent() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new(1, Duration::from_secs(60), Duration::ZERO)
                .with_scope(BucketScope::PerKey),
        );
        assert!(limiter.try_acquire("alice").await.is_ok());
        assert!(limiter.try_acquire("bob").await.is_ok());
        assert!(limiter.try_acquire("alice").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_bucket_ignores_key() {
        let limiter = limiter(1, 60, 0);
        assert!(limiter.try_acquire("alice").await.is_ok());
        let err = limiter.try_acquire("bob").await.unwrap_err();
        assert!(matches!(err, RateLimitError::RateExceeded { key, .. } if key == SHARED_BUCKET));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquisitions_never_overcount() {
        let limiter = limiter(50, 60, 0);
        let mut handles = Vec::new();
        for i in 0..200 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire(&format!("k{i}")).await.is_ok()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 50);
    }
}
