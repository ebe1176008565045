//! Batch processing configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ResilienceConfig;
use crate::reliability::{RetryOptions, RetryPolicy};

/// Configuration for a batch run
///
/// # Example
///
/// ```
/// use breakwater_resilience::BatchConfig;
/// use std::time::Duration;
///
/// let config = BatchConfig::default()
///     .with_max_concurrency(4)
///     .with_batch_size(20)
///     .with_rate_limit_delay(Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Items in flight at once within a chunk
    pub max_concurrency: usize,

    /// Items per chunk
    pub batch_size: usize,

    /// Pause between consecutive chunks
    #[serde(with = "crate::serde_millis")]
    pub rate_limit_delay: Duration,

    /// Attempt budget handed to [`RetryOptions`] by [`retry_options`](Self::retry_options)
    pub retry_attempts: u32,

    /// Deadline for each item (None = unbounded)
    #[serde(with = "crate::serde_millis::option")]
    pub timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            batch_size: 50,
            rate_limit_delay: Duration::from_secs(1),
            retry_attempts: 3,
            timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl BatchConfig {
    /// Create a new batch configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `BATCH_*` environment variables, see [`ResilienceConfig::from_env`]
    pub fn from_env() -> Self {
        ResilienceConfig::from_env().batch
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Set the per-item deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Let items run without a deadline
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Retry options whose attempt budget is `retry_attempts`
    ///
    /// Each attempt is bounded by the per-item `timeout`, so a hung attempt is
    /// reported to its circuit before the item deadline cancels the retry loop.
    pub fn retry_options<E>(&self) -> RetryOptions<E> {
        let options =
            RetryOptions::new(RetryPolicy::exponential().with_max_attempts(self.retry_attempts));
        match self.timeout {
            Some(limit) => options.with_attempt_timeout(limit),
            None => options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.rate_limit_delay, Duration::from_secs(1));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_builder_clamps_to_one() {
        let config = BatchConfig::new()
            .with_max_concurrency(0)
            .with_batch_size(0)
            .with_retry_attempts(0);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.retry_attempts, 1);
    }

    #[test]
    fn test_retry_options_use_attempt_budget() {
        let options: RetryOptions<String> = BatchConfig::new().with_retry_attempts(5).retry_options();
        assert_eq!(options.policy.max_attempts, 5);
        assert!(options.circuit.is_none());
    }

    #[test]
    fn test_retry_options_bound_attempts_by_item_timeout() {
        let config = BatchConfig::new().with_timeout(Duration::from_millis(750));
        let options: RetryOptions<String> = config.retry_options();
        assert_eq!(options.attempt_timeout, Some(Duration::from_millis(750)));

        let options: RetryOptions<String> = config.without_timeout().retry_options();
        assert_eq!(options.attempt_timeout, None);
    }

    #[test]
    fn test_serialization() {
        let config = BatchConfig::new().without_timeout();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["rate_limit_delay"], 1000);
        assert!(json["timeout"].is_null());

        let parsed: BatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
