//! Point-bucket rate limiting keyed by an arbitrary string.
//!
//! One limiter holds a single bucket. The bucket follows whichever key was
//! last checked: switching keys, or letting the window run out, starts a
//! fresh window with zero points. Once a bucket goes over its point budget it
//! stays limited until the window expires; later calls in the same window
//! cannot bring it back under.
//!
//! Used on accept (keyed by peer IP) and anywhere else a burst of cheap
//! events needs throttling.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Limits for a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Points allowed within one window.
    pub max_points: u32,
    /// Window length. Zero disables the limiter.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // 5 connects per 25 seconds per source address.
        Self {
            max_points: 5,
            window: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    key: Option<String>,
    start: Option<Instant>,
    points: u64,
}

/// A point bucket shared by every call site that checks it.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter. Returns `None` when the config disables limiting,
    /// which [`is_limited`] treats as "never limited".
    pub fn new(config: RateLimitConfig) -> Option<Self> {
        if config.window.is_zero() {
            return None;
        }
        Some(Self {
            config,
            bucket: Mutex::new(Bucket::default()),
        })
    }

    /// The configured limits.
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Charge `points` against `key`. Returns `true` when limited.
    pub fn check(&self, key: &str, points: u32) -> bool {
        self.check_at(key, points, Instant::now())
    }

    /// [`check`](Self::check) with an explicit clock.
    pub fn check_at(&self, key: &str, points: u32, now: Instant) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());

        let mut elapsed = bucket
            .start
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();

        let same_key = bucket.key.as_deref() == Some(key);
        if bucket.start.is_none() || elapsed > self.config.window || !same_key {
            bucket.key = Some(key.to_string());
            bucket.start = Some(now);
            bucket.points = 0;
            elapsed = Duration::ZERO;
        }

        bucket.points += u64::from(points);

        // Points are left in place when the limit trips.
        bucket.points > u64::from(self.config.max_points) && elapsed < self.config.window
    }
}

/// Check an optional limiter. An absent limiter never limits.
pub fn is_limited(limiter: Option<&RateLimiter>, key: &str, points: u32) -> bool {
    limiter.is_some_and(|l| l.check(key, points))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_points: u32, secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_points,
            window: Duration::from_secs(secs),
        })
        .expect("window is non-zero")
    }

    #[test]
    fn test_limited_status_is_sticky_within_window() {
        let l = limiter(100, 60);
        let t0 = Instant::now();

        assert!(l.check_at("k", 101, t0));
        assert!(l.check_at("k", 0, t0 + Duration::from_secs(10)));
        assert!(!l.check_at("k", 0, t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_under_budget_is_not_limited() {
        let l = limiter(5, 25);
        let t0 = Instant::now();

        for i in 0..5 {
            assert!(!l.check_at("10.0.0.1", 1, t0 + Duration::from_secs(i)));
        }
        assert!(l.check_at("10.0.0.1", 1, t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_key_change_starts_new_window() {
        let l = limiter(1, 60);
        let t0 = Instant::now();

        assert!(l.check_at("a", 2, t0));
        assert!(!l.check_at("b", 1, t0));
        // Back to "a": its earlier points are gone.
        assert!(!l.check_at("a", 1, t0));
    }

    #[test]
    fn test_zero_window_disables_limiter() {
        let disabled = RateLimiter::new(RateLimitConfig {
            max_points: 0,
            window: Duration::ZERO,
        });
        assert!(disabled.is_none());
        assert!(!is_limited(disabled.as_ref(), "k", 1_000));
    }

    #[test]
    fn test_absent_limiter_fails_open() {
        assert!(!is_limited(None, "anything", u32::MAX));
    }

    #[test]
    fn test_shared_between_threads() {
        let l = std::sync::Arc::new(limiter(1_000, 60));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let l = std::sync::Arc::clone(&l);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        l.check("shared", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }

        // Exactly 1000 points were charged; one more trips the limit.
        assert!(l.check("shared", 1));
    }
}
