//! Persistence layer for resilience state
//!
//! This module provides:
//! - [`CircuitStore`] and [`WindowStore`] traits
//! - [`InMemoryCircuitStore`] / [`InMemoryWindowStore`] for single-process use and tests
//! - [`PostgresCircuitStore`] / [`PostgresWindowStore`] for state shared across replicas

mod memory;
mod postgres;
mod store;

pub use memory::{InMemoryCircuitStore, InMemoryWindowStore};
pub use postgres::{migrate, PostgresCircuitStore, PostgresWindowStore};
pub use store::{CircuitStore, CircuitUpdate, WindowSample, WindowStore};

pub(crate) use store::window_millis;
