//! Per-service outbound rate limiting.
//!
//! Each target service owns one token bucket shared by every dispatcher worker.
//! Buckets refill continuously at `requests_per_minute / 60` tokens per second.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::models::TargetService;

/// Token bucket with continuous refill.
///
/// Callers reserve a token even when the bucket is empty; the balance goes
/// negative and the caller is told how long to wait for its slot. This keeps
/// waiters in arrival order without holding the lock while sleeping.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    tokens_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_window: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            tokens_per_sec: f64::from(refill_per_window) / window.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    /// Bucket for a requests-per-minute budget, allowing a burst of one
    /// second's worth of requests.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let burst = (requests_per_minute / 60).max(1);
        Self::new(burst, requests_per_minute, Duration::from_secs(60))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Consume one token if available without waiting.
    pub fn try_consume(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Reserve one token and return how long the caller must wait before using it.
    pub fn reserve(&mut self) -> Duration {
        self.refill(Instant::now());
        self.tokens -= 1.0;
        if self.tokens >= 0.0 || self.tokens_per_sec <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.tokens_per_sec)
        }
    }
}

/// Rate limiters for every target service.
#[derive(Debug)]
pub struct ServiceRateLimiter {
    buckets: HashMap<TargetService, Mutex<TokenBucket>>,
}

impl ServiceRateLimiter {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let buckets = TargetService::ALL
            .into_iter()
            .map(|service| {
                let bucket = TokenBucket::per_minute(config.requests_per_minute(service));
                (service, Mutex::new(bucket))
            })
            .collect();
        Self { buckets }
    }

    /// Wait until `service` may issue one more request. Returns the time spent waiting.
    pub async fn acquire(&self, service: TargetService) -> Duration {
        let Some(bucket) = self.buckets.get(&service) else {
            return Duration::ZERO;
        };

        let wait = bucket.lock().await.reserve();
        if !wait.is_zero() {
            tracing::debug!(
                target_service = %service,
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, delaying request"
            );
            tokio::time::sleep(wait).await;
        }
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::per_minute(60);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn reservations_queue_behind_each_other() {
        let mut bucket = TokenBucket::per_minute(60);
        assert_eq!(bucket.reserve(), Duration::ZERO);
        assert_eq!(bucket.reserve(), Duration::from_secs(1));
        assert_eq!(bucket.reserve(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn services_are_limited_independently() {
        let config = RateLimitConfig {
            default_requests_per_minute: 60,
            service_overrides: BTreeMap::from([(TargetService::Crm, 120)]),
        };
        let limiter = ServiceRateLimiter::from_config(&config);

        let start = Instant::now();
        limiter.acquire(TargetService::Fsm).await;
        limiter.acquire(TargetService::Fsm).await;
        assert!(start.elapsed() >= Duration::from_secs(1));

        let books_start = Instant::now();
        let waited = limiter.acquire(TargetService::Books).await;
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(books_start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn override_raises_throughput() {
        let config = RateLimitConfig {
            default_requests_per_minute: 60,
            service_overrides: BTreeMap::from([(TargetService::Crm, 120)]),
        };
        let limiter = ServiceRateLimiter::from_config(&config);

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire(TargetService::Crm).await;
        }
        // burst of 2, third request waits half a second
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
    }
}
