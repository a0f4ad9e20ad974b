//! Per-host token bucket rate limiter with lazy refill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use empresa_core::FailReason;
use tokio::sync::Mutex;

pub struct RateLimiterConfig {
    pub rpm_default: u32,
    pub rpm_slow: u32,
    pub burst_size: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rpm_default: 300,
            rpm_slow: 60,
            burst_size: 60,
        }
    }
}

struct Bucket {
    tokens: Mutex<f64>,
    last_refill: Mutex<Instant>,
    throttled: AtomicU64,
    not_throttled: AtomicU64,
}

pub struct RateLimiter {
    buckets: DashMap<String, std::sync::Arc<Bucket>>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    fn bucket(&self, host: &str) -> std::sync::Arc<Bucket> {
        self.buckets
            .entry(host.to_string())
            .or_insert_with(|| {
                std::sync::Arc::new(Bucket {
                    tokens: Mutex::new(self.config.burst_size as f64),
                    last_refill: Mutex::new(Instant::now()),
                    throttled: AtomicU64::new(0),
                    not_throttled: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Waits until a token is available for `host`, bounded by `timeout`.
    /// Refill is computed lazily from elapsed time at acquire time, not on
    /// a background timer.
    pub async fn acquire(&self, host: &str, slow: bool, timeout: Duration) -> Result<(), FailReason> {
        let rpm = if slow {
            self.config.rpm_slow
        } else {
            self.config.rpm_default
        };
        let rate_per_ms = rpm as f64 / 60_000.0;
        let bucket = self.bucket(host);
        let deadline = Instant::now() + timeout;

        loop {
            let wait = {
                let mut tokens = bucket.tokens.lock().await;
                let mut last_refill = bucket.last_refill.lock().await;
                let now = Instant::now();
                let elapsed_ms = now.duration_since(*last_refill).as_millis() as f64;
                *tokens = (*tokens + elapsed_ms * rate_per_ms).min(self.config.burst_size as f64);
                *last_refill = now;

                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - *tokens;
                    Some(Duration::from_millis((deficit / rate_per_ms).ceil() as u64))
                }
            };

            match wait {
                None => {
                    bucket.not_throttled.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Some(w) => {
                    bucket.throttled.fetch_add(1, Ordering::Relaxed);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(FailReason::InfraRatelimitTimeout);
                    }
                    tokio::time::sleep(w.min(remaining)).await;
                    if Instant::now() >= deadline {
                        return Err(FailReason::InfraRatelimitTimeout);
                    }
                }
            }
        }
    }

    pub fn throttled_count(&self, host: &str) -> u64 {
        self.buckets
            .get(host)
            .map(|b| b.throttled.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn not_throttled_count(&self, host: &str) -> u64 {
        self.buckets
            .get(host)
            .map(|b| b.not_throttled.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sums throttled/not-throttled counters across every host bucket seen
    /// so far, for the status object's infrastructure summary.
    pub fn totals(&self) -> (u64, u64) {
        self.buckets.iter().fold((0u64, 0u64), |(t, n), entry| {
            (
                t + entry.value().throttled.load(Ordering::Relaxed),
                n + entry.value().not_throttled.load(Ordering::Relaxed),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_consumed_immediately() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rpm_default: 60,
            rpm_slow: 60,
            burst_size: 3,
        });
        for _ in 0..3 {
            assert!(limiter.acquire("a.com", false, Duration::from_millis(10)).await.is_ok());
        }
        assert_eq!(limiter.not_throttled_count("a.com"), 3);
    }

    #[tokio::test]
    async fn exhausted_bucket_times_out_past_deadline() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rpm_default: 1,
            rpm_slow: 1,
            burst_size: 1,
        });
        assert!(limiter.acquire("a.com", false, Duration::from_millis(10)).await.is_ok());
        let res = limiter.acquire("a.com", false, Duration::from_millis(20)).await;
        assert!(matches!(res, Err(FailReason::InfraRatelimitTimeout)));
    }

    #[tokio::test]
    async fn slow_host_uses_lower_rate() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rpm_default: 6000,
            rpm_slow: 60,
            burst_size: 1,
        });
        assert!(limiter.acquire("slow.com", true, Duration::from_millis(5)).await.is_ok());
        // second immediate acquire should have to wait ~1s at 60rpm, so with a tiny deadline it times out
        let res = limiter.acquire("slow.com", true, Duration::from_millis(5)).await;
        assert!(res.is_err());
    }
}
