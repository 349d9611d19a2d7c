//! Per-client, per-endpoint rate limiting with fixed-window counters.
//!
//! A window opens on the first request for a key and lasts for the
//! configured duration. Increment-and-check runs while holding the DashMap
//! entry lock for that key, so concurrent requests for one key never both
//! pass on a stale count.

use axum::http::{HeaderMap, HeaderValue};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// In-memory fixed-window rate limiter.
///
/// The store lives in-process and cannot fail. A remote store would be
/// treated as fail-open: requests pass when the store is unreachable.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    max_attempts: u64,
    window: Duration,
    windows: DashMap<String, RateWindow>,
}

struct RateWindow {
    count: u64,
    started: Instant,
}

/// Limit metadata reported to the client on every response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Requests counted in the current window
    pub attempts: u64,
    /// Time until the current window closes
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed(RateLimitStatus),
    Limited(RateLimitStatus),
    /// The limiter is disabled
    Unlimited,
}

impl RateLimiter {
    /// Creates a new rate limiter. `max_attempts = 0` disables it.
    pub fn new(max_attempts: u64, window: Duration) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                max_attempts,
                window,
                windows: DashMap::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.max_attempts > 0
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Count a request from `client` against `path`
    pub fn check(&self, client: IpAddr, path: &str) -> RateDecision {
        self.check_key(&fingerprint(client, path))
    }

    /// Count a request against an already-derived key
    pub fn check_key(&self, key: &str) -> RateDecision {
        if !self.is_enabled() {
            return RateDecision::Unlimited;
        }

        let max_attempts = self.inner.max_attempts;
        let window = self.inner.window;

        let mut entry = self
            .inner
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow {
                count: 0,
                started: Instant::now(),
            });
        let state = entry.value_mut();

        if state.started.elapsed() >= window {
            state.count = 0;
            state.started = Instant::now();
        }

        let reset_after = window.saturating_sub(state.started.elapsed());

        if state.count >= max_attempts {
            return RateDecision::Limited(RateLimitStatus {
                limit: max_attempts,
                remaining: 0,
                attempts: state.count,
                reset_after,
            });
        }

        state.count += 1;
        RateDecision::Allowed(RateLimitStatus {
            limit: max_attempts,
            remaining: max_attempts - state.count,
            attempts: state.count,
            reset_after,
        })
    }

    /// Drop windows that have already closed
    pub fn purge_expired(&self) {
        let window = self.inner.window;
        self.inner
            .windows
            .retain(|_, state| state.started.elapsed() < window);
    }

    pub fn tracked_keys(&self) -> usize {
        self.inner.windows.len()
    }
}

/// Key for a (client, endpoint) pair
pub fn fingerprint(client: IpAddr, path: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", client, path).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("rate_limit:{}", hex)
}

impl RateLimitStatus {
    /// Whole seconds until the window closes, never zero
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let rounded = if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }

    /// Unix timestamp at which the window closes
    pub fn reset_at(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now + self.retry_after_secs()
    }

    /// Set `X-RateLimit-*` headers, plus `Retry-After` when `limited`
    pub fn apply_headers(&self, headers: &mut HeaderMap, limited: bool) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_at()));
        if limited {
            headers.insert("retry-after", HeaderValue::from(self.retry_after_secs()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    #[test]
    fn test_fourth_request_is_limited() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        for expected_remaining in [2, 1, 0] {
            match limiter.check(client(), "/geoip") {
                RateDecision::Allowed(status) => {
                    assert_eq!(status.remaining, expected_remaining);
                    assert_eq!(status.limit, 3);
                }
                other => panic!("expected allowed, got {:?}", other),
            }
        }

        match limiter.check(client(), "/geoip") {
            RateDecision::Limited(status) => {
                assert_eq!(status.remaining, 0);
                assert_eq!(status.attempts, 3);
                assert!(status.retry_after_secs() <= 60);
                assert!(status.retry_after_secs() >= 1);
            }
            other => panic!("expected limited, got {:?}", other),
        }
    }

    #[test]
    fn test_limits_are_per_endpoint() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));

        assert!(matches!(limiter.check(client(), "/geoip"), RateDecision::Allowed(_)));
        assert!(matches!(limiter.check(client(), "/geoip"), RateDecision::Limited(_)));
        assert!(matches!(limiter.check(client(), "/geoip/stats"), RateDecision::Allowed(_)));
    }

    #[test]
    fn test_limits_are_per_client() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let other: IpAddr = "198.51.100.1".parse().unwrap();

        assert!(matches!(limiter.check(client(), "/geoip"), RateDecision::Allowed(_)));
        assert!(matches!(limiter.check(other, "/geoip"), RateDecision::Allowed(_)));
    }

    #[test]
    fn test_window_resets_after_elapsing() {
        let limiter = RateLimiter::new(1, Duration::from_millis(30));

        assert!(matches!(limiter.check(client(), "/geoip"), RateDecision::Allowed(_)));
        assert!(matches!(limiter.check(client(), "/geoip"), RateDecision::Limited(_)));

        std::thread::sleep(Duration::from_millis(50));
        assert!(matches!(limiter.check(client(), "/geoip"), RateDecision::Allowed(_)));
    }

    #[test]
    fn test_disabled_limiter() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..10 {
            assert_eq!(limiter.check(client(), "/geoip"), RateDecision::Unlimited);
        }
    }

    #[test]
    fn test_concurrent_increments_have_no_lost_updates() {
        let limiter = RateLimiter::new(25, Duration::from_secs(60));
        let allowed = std::sync::atomic::AtomicU64::new(0);
        let limited = std::sync::atomic::AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        match limiter.check(client(), "/geoip") {
                            RateDecision::Allowed(_) => {
                                allowed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            }
                            RateDecision::Limited(_) => {
                                limited.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            }
                            RateDecision::Unlimited => unreachable!(),
                        }
                    }
                });
            }
        });

        assert_eq!(allowed.into_inner(), 25);
        assert_eq!(limited.into_inner(), 175);
    }

    #[test]
    fn test_purge_expired() {
        let limiter = RateLimiter::new(5, Duration::from_millis(20));
        limiter.check(client(), "/geoip");
        limiter.check(client(), "/geoip/ipv4");
        assert_eq!(limiter.tracked_keys(), 2);

        std::thread::sleep(Duration::from_millis(40));
        limiter.purge_expired();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_headers() {
        let status = RateLimitStatus {
            limit: 100,
            remaining: 0,
            attempts: 100,
            reset_after: Duration::from_millis(42_500),
        };
        let mut headers = HeaderMap::new();
        status.apply_headers(&mut headers, true);

        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "43");
        assert!(headers.contains_key("x-ratelimit-reset"));
    }
}
