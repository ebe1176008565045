//! Circuit breaker configuration and state machine
//!
//! The transitions live on [`CircuitRecord`] as plain functions of the current
//! record, the configuration and "now", so every [`CircuitStore`] applies the exact
//! same rules whether the record sits in memory or in a database row.
//!
//! [`CircuitStore`]: crate::persistence::CircuitStore

use std::borrow::Cow;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    #[default]
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Testing if the dependency recovered - a single probe allowed
    HalfOpen,
}

impl CircuitState {
    /// Stable string form, used for storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Parse the stable string form
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a circuit
///
/// Circuits are always named explicitly by the caller. Declare names once as
/// constants so unrelated call sites never share health by accident:
///
/// ```
/// use breakwater_resilience::CircuitName;
///
/// const GITHUB_API: CircuitName = CircuitName::from_static("github-api");
/// assert_eq!(GITHUB_API.as_str(), "github-api");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CircuitName(Cow<'static, str>);

impl CircuitName {
    /// Name usable in `const` position
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Name built at runtime (e.g. one circuit per tenant integration)
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CircuitName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CircuitName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for CircuitName {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for CircuitName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Circuit breaker configuration
///
/// Circuit breakers protect external services from cascading failures.
/// When consecutive failures reach a threshold, the circuit "opens" and calls
/// fail fast without reaching the service.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐ recovery timeout ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ───────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                  └──────────┘
///      ▲                               ▲       probe fails          │
///      │                               └────────────────────────────┤
///      │              probe succeeds                                │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use breakwater_resilience::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_recovery_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait after the last failure before admitting a probe
    #[serde(with = "crate::serde_millis")]
    pub recovery_timeout: Duration,

    /// Failures further apart than this do not accumulate toward the threshold
    #[serde(with = "crate::serde_millis")]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the recovery timeout (time before a probe is admitted)
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the period within which failures accumulate
    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }
}

/// Outcome of asking a circuit to admit a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call may proceed; `probe` is set when it is the single half-open probe
    Allowed { probe: bool },

    /// Call is rejected; a probe becomes possible after `retry_after`
    Rejected { retry_after: Duration },
}

/// Event applied to a circuit record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    /// A call wants to run
    Admit,
    /// An admitted call succeeded
    Success,
    /// An admitted call failed
    Failure,
}

/// Health record of a single named circuit
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Set while the half-open probe is in flight
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    /// A fresh closed circuit
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an event; returns the admission decision for [`CircuitEvent::Admit`]
    pub fn apply(
        &mut self,
        event: CircuitEvent,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Option<Admission> {
        match event {
            CircuitEvent::Admit => Some(self.admit(config, now)),
            CircuitEvent::Success => {
                self.record_success();
                None
            }
            CircuitEvent::Failure => {
                self.record_failure(config, now);
                None
            }
        }
    }

    /// Decide whether a call may run, moving Open to HalfOpen when a probe is due
    pub fn admit(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed { probe: false },
            CircuitState::Open => {
                let elapsed = self.last_failure_at.map(|at| elapsed_since(at, now));
                match elapsed {
                    Some(elapsed) if elapsed < config.recovery_timeout => Admission::Rejected {
                        retry_after: config.recovery_timeout - elapsed,
                    },
                    _ => {
                        self.state = CircuitState::HalfOpen;
                        self.probe_started_at = Some(now);
                        Admission::Allowed { probe: true }
                    }
                }
            }
            CircuitState::HalfOpen => {
                // A probe that never reported back is abandoned after the recovery timeout
                let in_flight = self
                    .probe_started_at
                    .map(|at| elapsed_since(at, now))
                    .filter(|elapsed| *elapsed < config.recovery_timeout);
                match in_flight {
                    Some(elapsed) => Admission::Rejected {
                        retry_after: config.recovery_timeout - elapsed,
                    },
                    None => {
                        self.probe_started_at = Some(now);
                        Admission::Allowed { probe: true }
                    }
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&mut self) {
        self.success_count = self.success_count.saturating_add(1);
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.probe_started_at = None;
            }
            // Late success from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
        match self.state {
            CircuitState::Closed => {
                let stale = self
                    .last_failure_at
                    .is_some_and(|at| elapsed_since(at, now) > config.monitoring_period);
                if stale {
                    self.failure_count = 0;
                }
                self.failure_count = self.failure_count.saturating_add(1);
                self.last_failure_at = Some(now);
                if self.failure_count >= config.failure_threshold {
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.last_failure_at = Some(now);
                self.probe_started_at = None;
                self.state = CircuitState::Open;
            }
            // Late failure from a call admitted before the circuit opened
            CircuitState::Open => {
                self.failure_count = self.failure_count.saturating_add(1);
            }
        }
    }
}

fn elapsed_since(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
