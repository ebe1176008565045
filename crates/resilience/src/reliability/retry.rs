//! Retry policy and executor

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreakerConfig, CircuitName};
use super::registry::CircuitRegistry;
use super::timeout::with_deadline;
use crate::error::ExecutionError;

/// Backoff schedule and attempt budget
///
/// Supports exponential backoff with jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use breakwater_resilience::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_millis(500))
///     .with_max_interval(Duration::from_secs(10));
///
/// // First retry after ~500ms
/// // Second retry after ~1s
/// // Third retry after ~2s
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "crate::serde_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "crate::serde_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy
    ///
    /// - 3 max attempts
    /// - 1 second initial interval
    /// - 30 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient (negative values are treated as 0.0)
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(0.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-based)
    ///
    /// Returns the duration to wait before that attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        // Fields are public and may be deserialized unchecked
        let capped = base.min(self.max_interval.as_secs_f64()).max(0.0);

        let jitter_range = capped * self.jitter;
        let jittered = if jitter_range > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Caller-supplied delay schedule, called with the 1-based retry number
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Caller-supplied retry predicate
pub type RetryPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Options for a single [`RetryExecutor::with_retry`] invocation
///
/// # Example
///
/// ```
/// use breakwater_resilience::{CircuitName, RetryOptions, RetryPolicy};
/// use std::time::Duration;
///
/// const OAUTH: CircuitName = CircuitName::from_static("oauth-token-exchange");
///
/// let options: RetryOptions<std::io::Error> = RetryOptions::new(RetryPolicy::exponential())
///     .with_circuit(OAUTH)
///     .with_attempt_timeout(Duration::from_secs(10))
///     .retry_if(|err: &std::io::Error| err.kind() != std::io::ErrorKind::PermissionDenied);
/// ```
pub struct RetryOptions<E> {
    pub policy: RetryPolicy,
    /// Circuit gating every attempt; `None` bypasses the breaker
    pub circuit: Option<CircuitName>,
    /// Overrides the registry's configuration for the circuit
    pub circuit_config: Option<CircuitBreakerConfig>,
    /// Deadline applied to each attempt
    pub attempt_timeout: Option<Duration>,
    delay_fn: Option<DelayFn>,
    retry_if: Option<RetryPredicate<E>>,
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            circuit: self.circuit.clone(),
            circuit_config: self.circuit_config.clone(),
            attempt_timeout: self.attempt_timeout,
            delay_fn: self.delay_fn.clone(),
            retry_if: self.retry_if.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("policy", &self.policy)
            .field("circuit", &self.circuit)
            .field("circuit_config", &self.circuit_config)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("custom_delay", &self.delay_fn.is_some())
            .field("custom_predicate", &self.retry_if.is_some())
            .finish()
    }
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<E> RetryOptions<E> {
    /// Options with the given policy, no circuit, and retry on every error
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            circuit: None,
            circuit_config: None,
            attempt_timeout: None,
            delay_fn: None,
            retry_if: None,
        }
    }

    /// Gate every attempt through the named circuit
    pub fn with_circuit(mut self, name: impl Into<CircuitName>) -> Self {
        self.circuit = Some(name.into());
        self
    }

    /// Use this configuration for the circuit instead of the registry's
    pub fn with_circuit_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_config = Some(config);
        self
    }

    /// Retry without consulting any circuit
    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit = None;
        self.circuit_config = None;
        self
    }

    /// Abandon each attempt after `limit`
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    /// Replace the policy's backoff with a custom schedule
    pub fn with_delay(mut self, delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.delay_fn = Some(Arc::new(delay));
        self
    }

    /// Only retry errors for which `predicate` returns true
    pub fn retry_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Delay before the given 1-based retry
    pub fn delay_for_retry(&self, retry_number: u32) -> Duration {
        match &self.delay_fn {
            Some(delay) => delay(retry_number),
            None => self.policy.delay_for_attempt(retry_number + 1),
        }
    }

    /// Whether an operation error should be retried
    pub fn should_retry(&self, error: &E) -> bool {
        self.retry_if.as_ref().map_or(true, |predicate| predicate(error))
    }

    fn is_retryable(&self, error: &ExecutionError<E>) -> bool {
        match error {
            ExecutionError::Operation(err) => self.should_retry(err),
            ExecutionError::Timeout(_) => true,
            ExecutionError::CircuitOpen { .. } => false,
        }
    }
}

/// Repeats fallible operations according to [`RetryOptions`]
///
/// Cheap to clone; clones share the same [`CircuitRegistry`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use breakwater_resilience::{CircuitBreakerConfig, CircuitRegistry, RetryExecutor, RetryOptions, RetryPolicy};
///
/// # tokio_test::block_on(async {
/// let retry = RetryExecutor::new(Arc::new(CircuitRegistry::in_memory(CircuitBreakerConfig::default())));
/// let options = RetryOptions::new(RetryPolicy::fixed(Duration::from_millis(1), 3));
///
/// let mut calls = 0;
/// let value = retry
///     .with_retry(&options, || {
///         calls += 1;
///         let attempt = calls;
///         async move { if attempt < 2 { Err("flaky") } else { Ok(attempt) } }
///     })
///     .await;
/// assert_eq!(value.unwrap(), 2);
/// # });
/// ```
#[derive(Clone)]
pub struct RetryExecutor {
    circuits: Arc<CircuitRegistry>,
}

impl RetryExecutor {
    /// Create an executor that gates named circuits through `circuits`
    pub fn new(circuits: Arc<CircuitRegistry>) -> Self {
        Self { circuits }
    }

    /// The registry backing circuit-gated attempts
    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    /// Run `operation` until it succeeds, fails non-retryably, or attempts run out
    ///
    /// An open circuit ends the loop immediately with
    /// [`ExecutionError::CircuitOpen`]. Every failed attempt, retryable or not, is
    /// reported to the circuit.
    pub async fn with_retry<T, E, F, Fut>(
        &self,
        options: &RetryOptions<E>,
        mut operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let permit = match &options.circuit {
                Some(name) => {
                    let config = options
                        .circuit_config
                        .clone()
                        .unwrap_or_else(|| self.circuits.config_for(name.as_str()));
                    Some(self.circuits.allow_with(name, &config).await?)
                }
                None => None,
            };

            let outcome = with_deadline(options.attempt_timeout, operation()).await;

            let err = match outcome {
                Ok(value) => {
                    if let Some(permit) = permit {
                        permit.success().await;
                    }
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(permit) = permit {
                        permit.failure().await;
                    }
                    err
                }
            };

            if !options.is_retryable(&err) {
                debug!(attempt, error = %err, "Error is not retryable");
                return Err(err);
            }

            if !options.policy.has_attempts_remaining(attempt) {
                warn!(
                    attempts = attempt,
                    circuit = options.circuit.as_ref().map(CircuitName::as_str),
                    error = %err,
                    "Retries exhausted"
                );
                return Err(err);
            }

            let delay = options.delay_for_retry(attempt);
            debug!(attempt, ?delay, error = %err, "Attempt failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
