//! Sliding-window rate limiter

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::persistence::{window_millis, InMemoryWindowStore, WindowStore};

/// Limit applied to one key
///
/// # Example
///
/// ```
/// use breakwater_resilience::RateLimitConfig;
/// use std::time::Duration;
///
/// let config = RateLimitConfig::per_minute(30);
/// assert_eq!(config.window, Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Length of the sliding window
    #[serde(with = "crate::serde_millis")]
    pub window: Duration,

    /// Requests allowed inside one window
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            window,
            max_requests,
        }
    }

    /// `max_requests` per 60 second window
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    fn window_ms(&self) -> i64 {
        window_millis(self.window)
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Configured maximum for the window
    pub limit: u32,
    /// Requests left in the current window after this one
    pub remaining: u32,
    /// When the window frees up (epoch ms)
    pub reset_at_ms: i64,
    /// Whole seconds the caller should wait, set only on rejection
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    /// Reset time as epoch seconds, rounded up
    pub fn reset_at_secs(&self) -> i64 {
        (self.reset_at_ms + 999).div_euclid(1000)
    }

    fn permissive(config: &RateLimitConfig, now_ms: i64) -> Self {
        Self {
            allowed: true,
            limit: config.max_requests,
            remaining: config.max_requests,
            reset_at_ms: now_ms.saturating_add(config.window_ms()),
            retry_after_secs: None,
        }
    }
}

/// Sliding-window rate limiter over a shared [`WindowStore`]
///
/// A store failure never blocks traffic: the check fails open with a
/// permissive decision and a warning.
///
/// # Example
///
/// ```
/// use breakwater_resilience::rate_limit::{user_key, RateLimitConfig, RateLimiter};
///
/// # tokio_test::block_on(async {
/// let limiter = RateLimiter::in_memory();
/// let config = RateLimitConfig::per_minute(2);
/// let key = user_key("u-1", "/api/scan");
///
/// assert!(limiter.check_rate_limit(&key, &config).await.allowed);
/// assert!(limiter.check_rate_limit(&key, &config).await.allowed);
/// assert!(!limiter.check_rate_limit(&key, &config).await.allowed);
/// # });
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
}

impl RateLimiter {
    /// Create a limiter over the given store
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self { store }
    }

    /// Create a process-local limiter
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryWindowStore::new()))
    }

    /// Count a request for `key` against `config`
    pub async fn check_rate_limit(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.check_at(key, config, Utc::now().timestamp_millis())
            .await
    }

    /// Count a request for `key` as if it arrived at `now_ms` (epoch ms)
    pub async fn check_at(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now_ms: i64,
    ) -> RateLimitDecision {
        let window_ms = config.window_ms();

        let sample = match self
            .store
            .record_hit(key, config.window, config.max_requests, now_ms)
            .await
        {
            Ok(sample) => sample,
            Err(e) => {
                warn!(key, error = %e, "Rate limit store unavailable, allowing request");
                return RateLimitDecision::permissive(config, now_ms);
            }
        };

        if sample.recorded {
            return RateLimitDecision {
                allowed: true,
                limit: config.max_requests,
                remaining: config.max_requests.saturating_sub(sample.count + 1),
                reset_at_ms: now_ms.saturating_add(window_ms),
                retry_after_secs: None,
            };
        }

        let reset_at_ms = sample.oldest_ms.unwrap_or(now_ms).saturating_add(window_ms);
        let wait_ms = (reset_at_ms - now_ms).max(0) as u64;
        let retry_after_secs = wait_ms.div_ceil(1000).max(1);

        debug!(key, count = sample.count, retry_after_secs, "Rate limit exceeded");

        RateLimitDecision {
            allowed: false,
            limit: config.max_requests,
            remaining: 0,
            reset_at_ms,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// Forget every request counted for `key`
    pub async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.store.clear(key).await
    }

    /// Drop idle keys from the store; returns the number of entries removed
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store
            .purge_expired(Utc::now().timestamp_millis())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::WindowSample;
    use async_trait::async_trait;

    const T0: i64 = 1_700_000_000_000;

    struct FailingStore;

    #[async_trait]
    impl WindowStore for FailingStore {
        async fn record_hit(
            &self,
            _key: &str,
            _window: Duration,
            _max: u32,
            _now_ms: i64,
        ) -> Result<WindowSample, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn clear(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn purge_expired(&self, _now_ms: i64) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn config() -> RateLimitConfig {
        RateLimitConfig::new(3, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = RateLimiter::in_memory();
        let config = config();

        let remaining: Vec<u32> = {
            let mut out = Vec::new();
            for i in 0..3 {
                let decision = limiter.check_at("k", &config, T0 + i * 100).await;
                assert!(decision.allowed);
                assert_eq!(decision.reset_at_ms, T0 + i * 100 + 10_000);
                out.push(decision.remaining);
            }
            out
        };
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_rejects_over_limit() {
        let limiter = RateLimiter::in_memory();
        let config = config();
        for i in 0..3 {
            limiter.check_at("k", &config, T0 + i * 1_000).await;
        }

        let decision = limiter.check_at("k", &config, T0 + 3_500).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at_ms, T0 + 10_000);
        assert_eq!(decision.retry_after_secs, Some(7));
    }

    #[tokio::test]
    async fn test_rejected_requests_are_not_counted() {
        let limiter = RateLimiter::in_memory();
        let config = RateLimitConfig::new(1, Duration::from_secs(10));

        limiter.check_at("k", &config, T0).await;
        for i in 1..5 {
            assert!(!limiter.check_at("k", &config, T0 + i * 1_000).await.allowed);
        }

        // Only the first request occupies the window
        assert!(limiter.check_at("k", &config, T0 + 10_001).await.allowed);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = RateLimiter::in_memory();
        let config = config();
        for i in 0..3 {
            limiter.check_at("k", &config, T0 + i * 1_000).await;
        }

        assert!(!limiter.check_at("k", &config, T0 + 10_000).await.allowed);
        let decision = limiter.check_at("k", &config, T0 + 10_001).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_retry_after_is_at_least_one_second() {
        let limiter = RateLimiter::in_memory();
        let config = RateLimitConfig::new(1, Duration::from_millis(200));

        limiter.check_at("k", &config, T0).await;
        let decision = limiter.check_at("k", &config, T0 + 150).await;
        assert_eq!(decision.retry_after_secs, Some(1));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::in_memory();
        let config = RateLimitConfig::new(1, Duration::from_secs(10));

        assert!(limiter.check_at("a", &config, T0).await.allowed);
        assert!(limiter.check_at("b", &config, T0).await.allowed);
        assert!(!limiter.check_at("a", &config, T0).await.allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_rejects_everything() {
        let limiter = RateLimiter::in_memory();
        let config = RateLimitConfig::new(0, Duration::from_secs(5));

        let decision = limiter.check_at("k", &config, T0).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(5));
    }

    #[test_log::test(tokio::test)]
    async fn test_fails_open_on_store_error() {
        let limiter = RateLimiter::new(Arc::new(FailingStore));
        let config = config();

        for _ in 0..10 {
            let decision = limiter.check_at("k", &config, T0).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 3);
            assert!(decision.retry_after_secs.is_none());
        }
        assert!(limiter.reset("k").await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_key() {
        let limiter = RateLimiter::in_memory();
        let config = RateLimitConfig::new(1, Duration::from_secs(10));

        limiter.check_at("k", &config, T0).await;
        limiter.reset("k").await.unwrap();
        assert!(limiter.check_at("k", &config, T0 + 1).await.allowed);
    }

    #[test]
    fn test_reset_at_secs_rounds_up() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 1,
            remaining: 0,
            reset_at_ms: 1_500,
            retry_after_secs: None,
        };
        assert_eq!(decision.reset_at_secs(), 2);
    }
}
