use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::config::RateLimitSettings;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket keyed by api-key or remote address; refills continuously at
/// `count / unit_seconds` tokens per second, capped at `count`.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            capacity: settings.count as f64,
            refill_per_sec: settings.count as f64 / settings.unit.as_secs() as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitSettings, RateLimitUnit};

    #[test]
    fn allows_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(&RateLimitSettings {
            count: 2,
            unit: RateLimitUnit::Minute,
        });
        assert!(limiter.try_acquire("client-a"));
        assert!(limiter.try_acquire("client-a"));
        assert!(!limiter.try_acquire("client-a"));
    }

    #[test]
    fn keys_are_tracked_independently() {
        let limiter = RateLimiter::new(&RateLimitSettings {
            count: 1,
            unit: RateLimitUnit::Minute,
        });
        assert!(limiter.try_acquire("client-a"));
        assert!(limiter.try_acquire("client-b"));
        assert!(!limiter.try_acquire("client-a"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(&RateLimitSettings {
            count: 1,
            unit: RateLimitUnit::Second,
        });
        assert!(limiter.try_acquire("client-a"));
        assert!(!limiter.try_acquire("client-a"));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.try_acquire("client-a"));
    }
}
