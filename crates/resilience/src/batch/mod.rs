//! Batch processing with bounded concurrency
//!
//! This module provides:
//! - [`BatchProcessor`] - Chunked, paced execution with a fixed in-flight cap
//! - [`BatchResult`] - Complete per-item accounting of a run
//! - [`group_by`] - Partitioning for one-call-per-group workloads

mod config;
mod group;
mod processor;
mod result;

pub use config::BatchConfig;
pub use group::group_by;
pub use processor::{BatchJob, BatchProcessor};
pub use result::{BatchFailure, BatchItemError, BatchResult};
