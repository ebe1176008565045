//! Injectable registry of named circuits
//!
//! The registry is constructed by the composition root and shared by reference
//! (`Arc<CircuitRegistry>`) with every component that gates calls through it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::circuit_breaker::{
    Admission, CircuitBreakerConfig, CircuitEvent, CircuitRecord, CircuitState,
};
use crate::error::{ExecutionError, StoreError};
use crate::persistence::{CircuitStore, CircuitUpdate, InMemoryCircuitStore};

/// A call was rejected because its circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{circuit}' is open")]
pub struct CircuitOpen {
    /// Name of the rejecting circuit
    pub circuit: String,
    /// Time until a probe will be admitted
    pub retry_after: Duration,
}

/// Permit that must be reported after a gated call
///
/// Obtained from [`CircuitRegistry::allow`]. Report the call's outcome with
/// [`success`](Self::success) or [`failure`](Self::failure). A permit dropped
/// without a report (the gated call was cancelled or hit a deadline) counts
/// as a failure.
#[must_use = "report the outcome with success() or failure()"]
pub struct CircuitPermit {
    store: Arc<dyn CircuitStore>,
    name: String,
    config: CircuitBreakerConfig,
    probe: bool,
    reported: bool,
}

impl CircuitPermit {
    /// Whether this call is the half-open recovery probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Name of the circuit this permit belongs to
    pub fn circuit(&self) -> &str {
        &self.name
    }

    /// Report the call succeeded
    pub async fn success(mut self) {
        self.reported = true;
        report(self.store.as_ref(), &self.name, CircuitEvent::Success, &self.config).await;
    }

    /// Report the call failed
    pub async fn failure(mut self) {
        self.reported = true;
        report(self.store.as_ref(), &self.name, CircuitEvent::Failure, &self.config).await;
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.reported {
            return;
        }

        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(circuit = %name, "Permit abandoned, recording failure");
                let store = self.store.clone();
                let config = self.config.clone();
                handle.spawn(async move {
                    report(store.as_ref(), &name, CircuitEvent::Failure, &config).await;
                });
            }
            Err(_) => {
                warn!(circuit = %name, "Permit abandoned outside a runtime, outcome lost");
            }
        }
    }
}

/// Registry of named circuit breakers
///
/// # Example
///
/// ```
/// use breakwater_resilience::{CircuitBreakerConfig, CircuitRegistry, CircuitState};
///
/// # tokio_test::block_on(async {
/// let registry = CircuitRegistry::in_memory(CircuitBreakerConfig::default());
///
/// let value: Result<u32, _> = registry
///     .execute("token-exchange", || async { Ok::<_, std::io::Error>(42) })
///     .await;
/// assert_eq!(value.unwrap(), 42);
///
/// let record = registry.status("token-exchange").await.unwrap().unwrap();
/// assert_eq!(record.state, CircuitState::Closed);
/// # });
/// ```
pub struct CircuitRegistry {
    store: Arc<dyn CircuitStore>,
    defaults: CircuitBreakerConfig,
    overrides: DashMap<String, CircuitBreakerConfig>,
}

impl CircuitRegistry {
    /// Create a registry backed by the given store
    pub fn new(store: Arc<dyn CircuitStore>, defaults: CircuitBreakerConfig) -> Self {
        Self {
            store,
            defaults,
            overrides: DashMap::new(),
        }
    }

    /// Create a process-local registry
    pub fn in_memory(defaults: CircuitBreakerConfig) -> Self {
        Self::new(Arc::new(InMemoryCircuitStore::new()), defaults)
    }

    /// Default configuration applied to circuits without an override
    pub fn defaults(&self) -> &CircuitBreakerConfig {
        &self.defaults
    }

    /// Set a configuration for one circuit
    pub fn configure(&self, name: impl AsRef<str>, config: CircuitBreakerConfig) {
        self.overrides.insert(name.as_ref().to_string(), config);
    }

    /// Configuration in effect for a circuit
    pub fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        self.overrides
            .get(name)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Ask the circuit to admit a call
    ///
    /// Returns a permit that must be used to report success/failure, or
    /// [`CircuitOpen`] without any call being made.
    pub async fn allow(&self, name: impl AsRef<str>) -> Result<CircuitPermit, CircuitOpen> {
        let name = name.as_ref();
        let config = self.config_for(name);
        self.allow_with(name, &config).await
    }

    /// Ask the circuit to admit a call using an explicit configuration
    pub async fn allow_with(
        &self,
        name: impl AsRef<str>,
        config: &CircuitBreakerConfig,
    ) -> Result<CircuitPermit, CircuitOpen> {
        let name = name.as_ref();
        let probe = match self
            .store
            .apply(name, CircuitEvent::Admit, config, Utc::now())
            .await
        {
            Ok(update) => {
                log_transition(name, &update);
                match update.admission {
                    Some(Admission::Rejected { retry_after }) => {
                        debug!(circuit = name, ?retry_after, "Circuit open, rejecting call");
                        return Err(CircuitOpen {
                            circuit: name.to_string(),
                            retry_after,
                        });
                    }
                    Some(Admission::Allowed { probe }) => probe,
                    None => false,
                }
            }
            Err(e) => {
                warn!(circuit = name, error = %e, "Circuit store unavailable, allowing call");
                false
            }
        };

        Ok(CircuitPermit {
            store: self.store.clone(),
            name: name.to_string(),
            config: config.clone(),
            probe,
            reported: false,
        })
    }

    /// Run an operation through the named circuit
    ///
    /// The operation's own error is returned as [`ExecutionError::Operation`];
    /// an open circuit yields [`ExecutionError::CircuitOpen`] and the operation
    /// is never invoked.
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: impl AsRef<str>,
        operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = name.as_ref();
        let config = self.config_for(name);
        self.execute_with(name, &config, operation).await
    }

    /// Run an operation through the named circuit with an explicit configuration
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        name: impl AsRef<str>,
        config: &CircuitBreakerConfig,
        operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.allow_with(name, config).await?;
        match operation().await {
            Ok(value) => {
                permit.success().await;
                Ok(value)
            }
            Err(err) => {
                permit.failure().await;
                Err(ExecutionError::Operation(err))
            }
        }
    }

    /// Get the record of a circuit, `None` if it was never referenced
    pub async fn status(&self, name: impl AsRef<str>) -> Result<Option<CircuitRecord>, StoreError> {
        self.store.get(name.as_ref()).await
    }

    /// Get every known circuit
    pub async fn all(&self) -> Result<HashMap<String, CircuitRecord>, StoreError> {
        self.store.list().await
    }

    /// Return a circuit to its initial closed state
    pub async fn reset(&self, name: impl AsRef<str>) -> Result<(), StoreError> {
        let name = name.as_ref();
        self.store.reset(name).await?;
        info!(circuit = name, "Circuit reset");
        Ok(())
    }

}

async fn report(
    store: &dyn CircuitStore,
    name: &str,
    event: CircuitEvent,
    config: &CircuitBreakerConfig,
) {
    match store.apply(name, event, config, Utc::now()).await {
        Ok(update) => log_transition(name, &update),
        Err(e) => {
            warn!(circuit = name, ?event, error = %e, "Failed to record circuit outcome");
        }
    }
}

fn log_transition(name: &str, update: &CircuitUpdate) {
    if !update.transitioned() {
        return;
    }
    let from = update.previous;
    let to = update.record.state;
    match to {
        CircuitState::Open => warn!(
            circuit = name,
            %from,
            %to,
            failure_count = update.record.failure_count,
            "Circuit opened"
        ),
        CircuitState::HalfOpen => info!(circuit = name, %from, %to, "Circuit probing recovery"),
        CircuitState::Closed => info!(circuit = name, %from, %to, "Circuit closed"),
    }
}
