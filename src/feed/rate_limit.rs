// =============================================================================
// Priority rate limiter — flood protection with a critical-event bypass
// =============================================================================
//
// Token bucket sized to one second of burst at the configured rate. Rug
// signals and game-end markers are marked critical by the caller and are
// never dropped, no matter how saturated the bucket is.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe limiter; counters are lock-free for snapshot readers.
pub struct PriorityRateLimiter {
    rate_per_sec: f64,
    bucket: Mutex<Bucket>,
    allowed: AtomicU64,
    limited: AtomicU64,
    bypassed: AtomicU64,
}

/// Immutable view of limiter activity for metrics consumers.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub allowed: u64,
    pub limited: u64,
    pub bypassed: u64,
    /// Share of non-critical signals dropped, in percent.
    pub drop_rate_pct: f64,
}

impl PriorityRateLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            rate_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: rate_per_sec,
                last_refill: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            limited: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
        }
    }

    /// Decide whether a signal passes. Critical signals always pass and are
    /// counted separately; ordinary signals consume a token or are dropped.
    pub fn should_process(&self, critical: bool) -> bool {
        if critical {
            self.bypassed.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let mut bucket = self.bucket.lock();
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.rate_per_sec);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            drop(bucket);
            self.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            drop(bucket);
            self.limited.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let limited = self.limited.load(Ordering::Relaxed);
        let bypassed = self.bypassed.load(Ordering::Relaxed);
        let ordinary = allowed + limited;
        RateLimiterSnapshot {
            allowed,
            limited,
            bypassed,
            drop_rate_pct: if ordinary > 0 {
                limited as f64 / ordinary as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_burst_up_to_rate() {
        let limiter = PriorityRateLimiter::new(20.0);
        let passed = (0..20).filter(|_| limiter.should_process(false)).count();
        assert_eq!(passed, 20);
        // Bucket drained; the next ordinary signal is dropped.
        assert!(!limiter.should_process(false));
        assert_eq!(limiter.snapshot().limited, 1);
    }

    #[test]
    fn critical_bypasses_saturated_bucket() {
        let limiter = PriorityRateLimiter::new(5.0);
        while limiter.should_process(false) {}
        // Sustained flood: criticals still pass, every time.
        for _ in 0..100 {
            assert!(limiter.should_process(true));
        }
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.bypassed, 100);
        assert!(snapshot.drop_rate_pct > 0.0);
    }

    #[test]
    fn refills_over_time() {
        let limiter = PriorityRateLimiter::new(1000.0);
        while limiter.should_process(false) {}
        std::thread::sleep(std::time::Duration::from_millis(20));
        // ~20 tokens refilled at 1000/s.
        assert!(limiter.should_process(false));
    }
}
