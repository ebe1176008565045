// Resilience Configuration
//
// Defaults for batches and circuits, loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::batch::BatchConfig;
use crate::reliability::CircuitBreakerConfig;

/// Process-wide defaults for the resilience layer
///
/// Every value can still be overridden per call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResilienceConfig {
    pub batch: BatchConfig,
    pub circuit: CircuitBreakerConfig,
}

impl ResilienceConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `BATCH_MAX_CONCURRENCY`: Items in flight per chunk (default: 10)
    /// - `BATCH_SIZE`: Items per chunk (default: 50)
    /// - `BATCH_RATE_LIMIT_DELAY_MS`: Pause between chunks (default: 1000)
    /// - `BATCH_RETRY_ATTEMPTS`: Attempt budget for retries (default: 3)
    /// - `BATCH_TIMEOUT_MS`: Per-item deadline, `0` disables (default: 30000)
    /// - `CIRCUIT_FAILURE_THRESHOLD`: Consecutive failures to open (default: 5)
    /// - `CIRCUIT_RECOVERY_TIMEOUT_MS`: Wait before a probe (default: 60000)
    /// - `CIRCUIT_MONITORING_PERIOD_MS`: Window for counting failures (default: 120000)
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = BatchConfig::default();

        let batch = BatchConfig::new()
            .with_max_concurrency(read(&lookup, "BATCH_MAX_CONCURRENCY", defaults.max_concurrency))
            .with_batch_size(read(&lookup, "BATCH_SIZE", defaults.batch_size))
            .with_rate_limit_delay(Duration::from_millis(read(
                &lookup,
                "BATCH_RATE_LIMIT_DELAY_MS",
                1_000,
            )))
            .with_retry_attempts(read(&lookup, "BATCH_RETRY_ATTEMPTS", defaults.retry_attempts));

        let batch = match read(&lookup, "BATCH_TIMEOUT_MS", 30_000u64) {
            0 => batch.without_timeout(),
            ms => batch.with_timeout(Duration::from_millis(ms)),
        };

        let circuit_defaults = CircuitBreakerConfig::default();
        let circuit = CircuitBreakerConfig::new()
            .with_failure_threshold(read(
                &lookup,
                "CIRCUIT_FAILURE_THRESHOLD",
                circuit_defaults.failure_threshold,
            ))
            .with_recovery_timeout(Duration::from_millis(read(
                &lookup,
                "CIRCUIT_RECOVERY_TIMEOUT_MS",
                60_000,
            )))
            .with_monitoring_period(Duration::from_millis(read(
                &lookup,
                "CIRCUIT_MONITORING_PERIOD_MS",
                120_000,
            )));

        Self { batch, circuit }
    }
}

fn read<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse().unwrap_or_else(|_| {
            warn!(variable = name, value = %raw, "Invalid value, using default");
            default
        }),
        _ => default,
    }
}
