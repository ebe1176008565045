//! # Breakwater Resilience
//!
//! Primitives for calling failure-prone, rate-limited and latency-variable upstreams
//! (cloud provider APIs, OAuth token exchanges, embedding services) without cascading
//! failures or blowing through upstream quotas.
//!
//! ## Features
//!
//! - **Circuit breakers**: per-name failure tracking with Closed/Open/HalfOpen states
//! - **Retries**: caller-controlled backoff, optionally gated through a named circuit
//! - **Rate limiting**: sliding-window counting against a store shared by all replicas
//! - **Batch processing**: bounded concurrency, chunk pacing and complete accounting
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      BatchProcessor                          │
//! │  (chunks, bounded in-flight set, pacing, per-item deadline) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ processor(item, index)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RetryExecutor                           │
//! │  (attempt budget, backoff, retry predicate)                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ per attempt
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CircuitRegistry                          │
//! │  (CircuitStore: in-memory or PostgreSQL)                     │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       RateLimiter                            │
//! │  (WindowStore: in-memory or PostgreSQL, fails open)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use breakwater_resilience::prelude::*;
//!
//! const EMBEDDINGS: CircuitName = CircuitName::from_static("embeddings");
//!
//! let circuits = Arc::new(CircuitRegistry::in_memory(CircuitBreakerConfig::default()));
//! let retry = RetryExecutor::new(circuits.clone());
//! let options = RetryOptions::new(RetryPolicy::exponential()).with_circuit(EMBEDDINGS);
//!
//! let result = BatchProcessor::new(BatchConfig::default())
//!     .batch(documents)
//!     .validate(|doc| !doc.text.is_empty())
//!     .process(|doc, _index| {
//!         let retry = retry.clone();
//!         let options = options.clone();
//!         async move { retry.with_retry(&options, || embed(doc.clone())).await }
//!     })
//!     .await;
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod persistence;
pub mod rate_limit;
pub mod reliability;

mod serde_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{
        group_by, BatchConfig, BatchFailure, BatchItemError, BatchJob, BatchProcessor,
        BatchResult,
    };
    pub use crate::config::ResilienceConfig;
    pub use crate::error::{ExecutionError, StoreError};
    pub use crate::persistence::{
        CircuitStore, InMemoryCircuitStore, InMemoryWindowStore, PostgresCircuitStore,
        PostgresWindowStore, WindowStore,
    };
    pub use crate::rate_limit::{
        global_key, ip_key, user_key, RateLimitConfig, RateLimitDecision, RateLimiter,
    };
    pub use crate::reliability::{
        CircuitBreakerConfig, CircuitName, CircuitOpen, CircuitRecord, CircuitRegistry,
        CircuitState, RetryExecutor, RetryOptions, RetryPolicy,
    };
}

// Re-export key types at crate root
pub use batch::{BatchConfig, BatchProcessor, BatchResult};
pub use config::ResilienceConfig;
pub use error::{ExecutionError, StoreError};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use reliability::{
    CircuitBreakerConfig, CircuitName, CircuitOpen, CircuitRecord, CircuitRegistry,
    CircuitState, RetryExecutor, RetryOptions, RetryPolicy,
};
