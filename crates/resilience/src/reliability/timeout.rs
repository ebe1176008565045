//! Deadline enforcement
//!
//! A deadline races the work future against a tokio timer. On expiry the work
//! future is dropped, which cancels it at its next suspension point.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::error::ExecutionError;

/// Work did not settle before its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline of {limit:?} exceeded")]
pub struct DeadlineExceeded {
    pub limit: Duration,
}

/// Run a future under an optional deadline
///
/// `None` runs the future to completion.
pub async fn run_with_deadline<F>(
    limit: Option<Duration>,
    future: F,
) -> Result<F::Output, DeadlineExceeded>
where
    F: Future,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| DeadlineExceeded { limit }),
        None => Ok(future.await),
    }
}

/// Run a fallible future under an optional deadline, folding expiry into
/// [`ExecutionError::Timeout`]
pub async fn with_deadline<T, E, F>(
    limit: Option<Duration>,
    future: F,
) -> Result<T, ExecutionError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match run_with_deadline(limit, future).await {
        Ok(result) => result.map_err(ExecutionError::Operation),
        Err(expired) => Err(ExecutionError::Timeout(expired.limit)),
    }
}
