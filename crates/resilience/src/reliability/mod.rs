//! Reliability patterns for calls to external dependencies
//!
//! This module provides:
//! - [`CircuitRegistry`] - Named circuit breakers backed by a [`CircuitStore`]
//! - [`RetryExecutor`] - Retries with backoff, optionally gated through a circuit
//! - [`run_with_deadline`] - Deadline enforcement for a single future
//!
//! [`CircuitStore`]: crate::persistence::CircuitStore

mod circuit_breaker;
mod registry;
mod retry;
mod timeout;

pub use circuit_breaker::{
    Admission, CircuitBreakerConfig, CircuitEvent, CircuitName, CircuitRecord, CircuitState,
};
pub use registry::{CircuitOpen, CircuitPermit, CircuitRegistry};
pub use retry::{DelayFn, RetryExecutor, RetryOptions, RetryPolicy, RetryPredicate};
pub use timeout::{run_with_deadline, with_deadline, DeadlineExceeded};
