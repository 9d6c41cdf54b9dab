//! Per-provider token bucket rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// A single provider's token bucket. Capacity is `max(1, rate * 2)`; refill
/// is continuous based on elapsed wall time, not a fixed tick.
struct Bucket {
    rate_per_second: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_second: f64) -> Self {
        let capacity = (rate_per_second * 2.0).max(1.0);
        Bucket {
            rate_per_second,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_second).min(self.capacity);
        self.last_refill = Instant::now();
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self) -> Duration {
        if self.rate_per_second <= 0.0 {
            return Duration::from_secs(u64::MAX / 2);
        }
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.rate_per_second)
    }
}

/// Default requests-per-second for known providers; anything else
/// defaults to 1.
pub fn default_rate(provider: &str) -> f64 {
    match provider {
        "musicbrainz" => 1.0,
        "discogs" => 2.0,
        "fanarttv" => 2.0,
        "theaudiodb" => 1.0,
        "wikimedia" => 10.0,
        "images" => 5.0,
        _ => 1.0,
    }
}

/// Holds one token bucket per provider, created lazily on first use.
pub struct RateLimiterManager {
    buckets: Mutex<HashMap<String, Bucket>>,
    overrides: HashMap<String, f64>,
}

impl RateLimiterManager {
    pub fn new(overrides: HashMap<String, f64>) -> Self {
        RateLimiterManager {
            buckets: Mutex::new(HashMap::new()),
            overrides,
        }
    }

    fn rate_for(&self, provider: &str) -> f64 {
        self.overrides
            .get(provider)
            .copied()
            .unwrap_or_else(|| default_rate(provider))
    }

    /// Waits for a token, returning `true` on success or `false` if
    /// `timeout` elapses first.
    pub async fn acquire(&self, provider: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().unwrap();
                let bucket = buckets
                    .entry(provider.to_string())
                    .or_insert_with(|| Bucket::new(self.rate_for(provider)));
                if bucket.try_acquire() {
                    return true;
                }
                bucket.time_until_next_token()
            };

            if Instant::now() >= deadline {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(wait.min(remaining)).await;
            if Instant::now() >= deadline {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_defaults_to_rate_one() {
        assert_eq!(default_rate("some_new_provider"), 1.0);
        assert_eq!(default_rate("wikimedia"), 10.0);
    }

    #[tokio::test]
    async fn burst_capacity_allows_immediate_acquires_up_to_capacity() {
        let manager = RateLimiterManager::new(HashMap::new());
        // images -> rate 5, capacity 10.
        for _ in 0..10 {
            assert!(manager.acquire("images", Duration::from_millis(1)).await);
        }
        // The 11th immediate acquire should not succeed within a tiny timeout.
        assert!(!manager.acquire("images", Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn acquire_eventually_succeeds_after_waiting_for_refill() {
        let mut overrides = HashMap::new();
        overrides.insert("slow".to_string(), 50.0);
        let manager = RateLimiterManager::new(overrides);
        for _ in 0..100 {
            manager.acquire("slow", Duration::from_millis(1)).await;
        }
        assert!(manager.acquire("slow", Duration::from_millis(200)).await);
    }
}
