//! Error types shared across the resilience layer

use std::time::Duration;

use thiserror::Error;

use crate::reliability::CircuitOpen;

/// Error type for store operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Error returned by guarded execution (circuit breaker, retries, deadlines)
///
/// `Operation` carries the wrapped operation's own error untouched; the other
/// variants are produced by the resilience layer and never by the operation, so
/// callers can map them to "service unavailable" semantics.
#[derive(Debug, Error)]
pub enum ExecutionError<E> {
    /// The circuit rejected the call without invoking the operation
    #[error("circuit '{circuit}' is open (retry after {retry_after:?})")]
    CircuitOpen {
        circuit: String,
        retry_after: Duration,
    },

    /// The operation did not settle before its deadline and was abandoned
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation itself failed
    #[error("{0}")]
    Operation(E),
}

impl<E> ExecutionError<E> {
    /// Whether the call was rejected by an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether the call was abandoned at its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Borrow the operation's own error, if that is what failed
    pub fn operation(&self) -> Option<&E> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// Take the operation's own error, if that is what failed
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// Convert the operation error, keeping layer-produced variants as they are
    pub fn map_operation<F>(self, f: impl FnOnce(E) -> F) -> ExecutionError<F> {
        match self {
            Self::CircuitOpen {
                circuit,
                retry_after,
            } => ExecutionError::CircuitOpen {
                circuit,
                retry_after,
            },
            Self::Timeout(limit) => ExecutionError::Timeout(limit),
            Self::Operation(err) => ExecutionError::Operation(f(err)),
        }
    }
}

impl<E> From<CircuitOpen> for ExecutionError<E> {
    fn from(open: CircuitOpen) -> Self {
        Self::CircuitOpen {
            circuit: open.circuit,
            retry_after: open.retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_accessors() {
        let err: ExecutionError<&str> = ExecutionError::Operation("boom");
        assert_eq!(err.operation(), Some(&"boom"));
        assert!(!err.is_circuit_open());
        assert!(!err.is_timeout());
        assert_eq!(err.into_operation(), Some("boom"));
    }

    #[test]
    fn test_circuit_open_from() {
        let err: ExecutionError<String> = CircuitOpen {
            circuit: "billing".to_string(),
            retry_after: Duration::from_secs(3),
        }
        .into();

        assert!(err.is_circuit_open());
        assert!(err.operation().is_none());
        assert_eq!(err.to_string(), "circuit 'billing' is open (retry after 3s)");
    }

    #[test]
    fn test_map_operation_keeps_layer_errors() {
        let err: ExecutionError<u32> = ExecutionError::Timeout(Duration::from_millis(50));
        let mapped = err.map_operation(|code| format!("code {code}"));
        assert!(mapped.is_timeout());

        let err: ExecutionError<u32> = ExecutionError::Operation(7);
        let mapped = err.map_operation(|code| format!("code {code}"));
        assert_eq!(mapped.to_string(), "code 7");
    }
}
