//! Per-client-IP token bucket rate limiter.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub max_tokens: u64,
    pub refill_rate: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            refill_rate: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: Mutex<u64>,
    last_refill: Mutex<Instant>,
}

impl Bucket {
    fn new(max_tokens: u64) -> Self {
        Self {
            tokens: Mutex::new(max_tokens),
            last_refill: Mutex::new(Instant::now()),
        }
    }
}

/// Token-bucket-per-IP admission gate. Bucket creation uses the map's own
/// write lock as the load-or-store point so concurrent first-requests from
/// the same IP can't allocate two buckets; token mutation after that only
/// takes the individual bucket's own lock.
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: RwLock<HashMap<String, Bucket>>,
    last_sweep: Mutex<Instant>,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const BUCKET_TTL: Duration = Duration::from_secs(3600);

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// `allow(ip)`: lookup-or-create the bucket, refill based on elapsed
    /// time, then admit if tokens remain.
    pub fn allow(&self, ip: &str) -> bool {
        self.maybe_sweep();

        {
            let buckets = self.buckets.read().expect("rate limiter lock poisoned");
            if let Some(bucket) = buckets.get(ip) {
                return self.try_consume(bucket);
            }
        }

        let mut buckets = self.buckets.write().expect("rate limiter lock poisoned");
        let bucket = buckets
            .entry(ip.to_string())
            .or_insert_with(|| Bucket::new(self.config.max_tokens));
        self.try_consume(bucket)
    }

    fn try_consume(&self, bucket: &Bucket) -> bool {
        let mut tokens = bucket.tokens.lock().expect("bucket tokens lock poisoned");
        let mut last_refill = bucket.last_refill.lock().expect("bucket refill lock poisoned");

        let elapsed = last_refill.elapsed();
        let refilled = (elapsed.as_nanos() / self.config.refill_rate.as_nanos().max(1)) as u64;
        if refilled > 0 {
            *tokens = (*tokens + refilled).min(self.config.max_tokens);
            *last_refill = Instant::now();
        }

        if *tokens > 0 {
            *tokens -= 1;
            true
        } else {
            false
        }
    }

    fn maybe_sweep(&self) {
        let mut last_sweep = self.last_sweep.lock().expect("sweep lock poisoned");
        if last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        *last_sweep = Instant::now();
        drop(last_sweep);

        let mut buckets = self.buckets.write().expect("rate limiter lock poisoned");
        buckets.retain(|_, bucket| {
            bucket
                .last_refill
                .lock()
                .map(|t| t.elapsed() < BUCKET_TTL)
                .unwrap_or(true)
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.read().expect("rate limiter lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max_tokens_then_rejects() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_tokens: 5,
            refill_rate: Duration::from_millis(100),
        });
        for _ in 0..5 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn separate_ips_have_separate_buckets() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_tokens: 1,
            refill_rate: Duration::from_secs(1),
        });
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("5.6.7.8"));
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn refills_after_elapsed_time() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_tokens: 5,
            refill_rate: Duration::from_millis(50),
        });
        for _ in 0..5 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(limiter.allow("1.2.3.4"));
    }
}
