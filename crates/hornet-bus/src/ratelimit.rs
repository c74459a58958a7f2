//! HORNET: Rate Limiter
//!
//! Token-bucket limiter keyed by (tenant, endpoint path). Refill rate and
//! capacity come from the tenant's subscription tier. The bucket map is
//! guarded by one mutex so concurrent acquirers observe a consistent state.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Decision returned for every acquire, used for response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    /// Bucket capacity (requests per minute)
    pub limit: u32,
    /// Whole tokens remaining after this acquire
    pub remaining: u32,
    /// Seconds until one token refills
    pub reset_secs: u64,
}

/// In-process token-bucket rate limiter.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take one token from the bucket for `key`, where the bucket
    /// holds `requests_per_minute` tokens at capacity and refills linearly.
    pub fn acquire(&self, key: &str, requests_per_minute: u32) -> RateDecision {
        let capacity = requests_per_minute as f64;
        let rate_per_sec = capacity / 60.0;
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let reset_secs = if bucket.tokens >= 1.0 {
            0
        } else {
            ((1.0 - bucket.tokens) / rate_per_sec).ceil() as u64
        };

        RateDecision {
            allowed,
            limit: requests_per_minute,
            remaining: bucket.tokens.floor().max(0.0) as u32,
            reset_secs,
        }
    }

    /// Drop buckets idle for longer than the given seconds. Called by the
    /// maintenance job to bound memory.
    pub fn evict_idle(&self, idle_secs: u64) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.last_refill).as_secs() < idle_secs);
        before - buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_exhausts_at_capacity() {
        let limiter = RateLimiter::new();
        for _ in 0..60 {
            assert!(limiter.acquire("t1:/api/v1/events", 60).allowed);
        }
        let decision = limiter.acquire("t1:/api/v1/events", 60);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_secs >= 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..60 {
            limiter.acquire("t1:/events", 60);
        }
        assert!(!limiter.acquire("t1:/events", 60).allowed);
        assert!(limiter.acquire("t2:/events", 60).allowed);
        assert!(limiter.acquire("t1:/incidents", 60).allowed);
    }

    #[test]
    fn test_decision_headers() {
        let limiter = RateLimiter::new();
        let d = limiter.acquire("k", 100);
        assert!(d.allowed);
        assert_eq!(d.limit, 100);
        assert_eq!(d.remaining, 99);
    }

    #[test]
    fn test_evict_idle_keeps_fresh_buckets() {
        let limiter = RateLimiter::new();
        limiter.acquire("fresh", 60);
        assert_eq!(limiter.evict_idle(3600), 0);
        assert_eq!(limiter.evict_idle(0), 1);
    }
}
