//! Store trait definitions

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::reliability::{Admission, CircuitBreakerConfig, CircuitEvent, CircuitRecord, CircuitState};

/// Result of applying an event to a circuit
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitUpdate {
    /// State before the event
    pub previous: CircuitState,
    /// Record after the event
    pub record: CircuitRecord,
    /// Admission decision, present for [`CircuitEvent::Admit`]
    pub admission: Option<Admission>,
}

impl CircuitUpdate {
    /// Whether the event moved the circuit to a different state
    pub fn transitioned(&self) -> bool {
        self.previous != self.record.state
    }
}

/// Store for circuit health records
///
/// Implementations must apply each event as a single read-modify-write so that
/// concurrent callers never lose an update. The transition rules themselves live
/// on [`CircuitRecord::apply`].
#[async_trait]
pub trait CircuitStore: Send + Sync + 'static {
    /// Apply an event to the named circuit, creating a closed record on first use
    async fn apply(
        &self,
        name: &str,
        event: CircuitEvent,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Result<CircuitUpdate, StoreError>;

    /// Get the record of a circuit, if it has ever been referenced
    async fn get(&self, name: &str) -> Result<Option<CircuitRecord>, StoreError>;

    /// Get every known circuit
    async fn list(&self) -> Result<HashMap<String, CircuitRecord>, StoreError>;

    /// Return a circuit to its initial closed state
    async fn reset(&self, name: &str) -> Result<(), StoreError>;
}

/// Snapshot of a key's window taken while recording a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSample {
    /// Entries inside the window before this hit
    pub count: u32,
    /// Timestamp (epoch ms) of the oldest entry inside the window
    pub oldest_ms: Option<i64>,
    /// Whether this hit was appended (false when the limit was already reached)
    pub recorded: bool,
}

/// Shared store of timestamped hits for sliding-window rate limiting
///
/// `record_hit` is the unit of consistency: prune, count and conditional append
/// happen atomically for a key, so concurrent replicas cannot overshoot the limit.
#[async_trait]
pub trait WindowStore: Send + Sync + 'static {
    /// Prune entries older than `now_ms - window`, count the rest, and append
    /// `now_ms` when the count is below `max`
    async fn record_hit(
        &self,
        key: &str,
        window: Duration,
        max: u32,
        now_ms: i64,
    ) -> Result<WindowSample, StoreError>;

    /// Remove every entry for a key
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Drop entries whose key expiry has passed; returns how many were removed
    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError>;
}

/// Window length in milliseconds, saturating at `i64::MAX`
pub(crate) fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}
