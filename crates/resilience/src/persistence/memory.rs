//! In-memory store implementations
//!
//! Correct for a single process. Every replica gets its own state, so use the
//! PostgreSQL stores when health or quotas must be shared.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::store::*;
use super::window_millis;
use crate::error::StoreError;
use crate::reliability::{CircuitBreakerConfig, CircuitEvent, CircuitRecord};

/// In-memory implementation of [`CircuitStore`]
///
/// # Example
///
/// ```
/// use breakwater_resilience::persistence::InMemoryCircuitStore;
///
/// let store = InMemoryCircuitStore::new();
/// assert_eq!(store.circuit_count(), 0);
/// ```
pub struct InMemoryCircuitStore {
    circuits: Mutex<HashMap<String, CircuitRecord>>,
}

impl InMemoryCircuitStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Get the number of circuits referenced so far
    pub fn circuit_count(&self) -> usize {
        self.circuits.lock().len()
    }
}

impl Default for InMemoryCircuitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CircuitStore for InMemoryCircuitStore {
    async fn apply(
        &self,
        name: &str,
        event: CircuitEvent,
        config: &CircuitBreakerConfig,
        now: DateTime<Utc>,
    ) -> Result<CircuitUpdate, StoreError> {
        let mut circuits = self.circuits.lock();
        let record = circuits.entry(name.to_string()).or_default();
        let previous = record.state;
        let admission = record.apply(event, config, now);

        Ok(CircuitUpdate {
            previous,
            record: record.clone(),
            admission,
        })
    }

    async fn get(&self, name: &str) -> Result<Option<CircuitRecord>, StoreError> {
        Ok(self.circuits.lock().get(name).cloned())
    }

    async fn list(&self) -> Result<HashMap<String, CircuitRecord>, StoreError> {
        Ok(self.circuits.lock().clone())
    }

    async fn reset(&self, name: &str) -> Result<(), StoreError> {
        self.circuits
            .lock()
            .insert(name.to_string(), CircuitRecord::new());
        Ok(())
    }
}

/// Hits recorded for one key, oldest first
#[derive(Default)]
struct KeyWindow {
    hits: VecDeque<i64>,
    expires_at_ms: i64,
}

#[derive(Default)]
struct WindowState {
    keys: HashMap<String, KeyWindow>,
    /// Earliest time `record_hit` sweeps expired keys again
    next_sweep_ms: i64,
}

impl WindowState {
    fn sweep(&mut self, now_ms: i64) -> u64 {
        let mut removed = 0u64;
        self.keys.retain(|_, window| {
            if window.expires_at_ms < now_ms {
                removed += window.hits.len() as u64;
                false
            } else {
                true
            }
        });
        removed
    }
}

/// In-memory implementation of [`WindowStore`]
///
/// Expired keys are swept at most once per window from inside `record_hit`,
/// so the map stays bounded by the keys active in the last window.
///
/// # Example
///
/// ```
/// use breakwater_resilience::persistence::InMemoryWindowStore;
///
/// let store = InMemoryWindowStore::new();
/// assert_eq!(store.key_count(), 0);
/// ```
pub struct InMemoryWindowStore {
    state: Mutex<WindowState>,
}

impl InMemoryWindowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WindowState::default()),
        }
    }

    /// Get the number of keys currently tracked
    pub fn key_count(&self) -> usize {
        self.state.lock().keys.len()
    }
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn record_hit(
        &self,
        key: &str,
        window: Duration,
        max: u32,
        now_ms: i64,
    ) -> Result<WindowSample, StoreError> {
        let window_ms = window_millis(window);
        let window_start = now_ms.saturating_sub(window_ms);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if now_ms >= state.next_sweep_ms {
            let removed = state.sweep(now_ms);
            state.next_sweep_ms = now_ms.saturating_add(window_ms);
            if removed > 0 {
                debug!(removed, "Swept expired rate limit keys");
            }
        }

        let entry = state.keys.entry(key.to_string()).or_default();

        while entry.hits.front().is_some_and(|&at| at < window_start) {
            entry.hits.pop_front();
        }

        let count = entry.hits.len() as u32;
        let oldest_ms = entry.hits.front().copied();
        let recorded = count < max;

        if recorded {
            // Keep the deque sorted even if callers hand in out-of-order clocks
            let position = entry.hits.partition_point(|&at| at <= now_ms);
            entry.hits.insert(position, now_ms);
            entry.expires_at_ms = entry.expires_at_ms.max(now_ms.saturating_add(window_ms));
        }

        if entry.hits.is_empty() {
            state.keys.remove(key);
        }

        Ok(WindowSample {
            count,
            oldest_ms,
            recorded,
        })
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().keys.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64, StoreError> {
        Ok(self.state.lock().sweep(now_ms))
    }
}
