//! Batch outcome types

use std::time::Duration;

use thiserror::Error;

/// Why a single item failed
#[derive(Debug, Error)]
pub enum BatchItemError<E> {
    /// The item did not settle before the per-item deadline
    #[error("item timed out after {0:?}")]
    Timeout(Duration),

    /// The processor returned an error
    #[error("{0}")]
    Failed(E),
}

impl<E> BatchItemError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The processor's own error, if that is what failed
    pub fn processor_error(&self) -> Option<&E> {
        match self {
            Self::Failed(err) => Some(err),
            Self::Timeout(_) => None,
        }
    }
}

/// A failed item together with its position in the input
#[derive(Debug)]
pub struct BatchFailure<T, E> {
    pub index: usize,
    pub item: T,
    pub error: BatchItemError<E>,
}

/// Complete accounting of a batch run
///
/// Every input item lands in exactly one of `succeeded`, `failed` or `skipped`.
#[derive(Debug)]
pub struct BatchResult<T, R, E> {
    /// Results of successful items, in input order
    pub succeeded: Vec<R>,
    /// Failed items, in input order
    pub failed: Vec<BatchFailure<T, E>>,
    /// Items rejected by the validator, in input order
    pub skipped: Vec<T>,
    /// Number of input items
    pub total: usize,
    /// Wall-clock time of the whole run
    pub duration: Duration,
}

impl<T, R, E> BatchResult<T, R, E> {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// True when nothing failed (skipped items do not count as failures)
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Indices of the failed items
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed.iter().map(|failure| failure.index).collect()
    }
}
