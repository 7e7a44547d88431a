// Copyright (c) 2026 Loom Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy for the knowledge fabric.
//!
//! Every fallible public operation in this crate returns [`Result`]. The
//! variants map one-to-one onto the failure kinds callers are expected to
//! branch on: configuration problems are fatal at start, backend loss is
//! retried inside the graph access layer before it surfaces, validation
//! failures are never retried.

use thiserror::Error;

/// Fabric error type
#[derive(Debug, Error)]
pub enum FabricError {
    /// Malformed or missing required configuration; fatal at start
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The graph backend is unreachable (transport loss, connect failure)
    #[error("graph backend unavailable: {0}")]
    BackendUnavailable(String),

    /// No pooled connection became available within the configured wait
    #[error("connection pool exhausted after {waited_ms}ms; retry later")]
    PoolExhausted { waited_ms: u64 },

    /// Input rejected by schema validation; lists every violation found
    #[error("validation failed: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    /// A referenced node does not exist
    #[error("{label} not found: {id}")]
    EntityNotFound { label: String, id: String },

    /// A node with the same id already exists under the label
    #[error("duplicate {label} id: {id}")]
    DuplicateId { label: String, id: String },

    /// An existing schema definition was redefined incompatibly
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    /// A statement was rejected by the backend
    #[error("query failed: {message} (statement: {statement})")]
    Query { statement: String, message: String },

    /// The dispatch queue stayed full past the bounded wait
    #[error("event pipeline backpressure exceeded")]
    BackpressureExceeded,

    /// The event processor has been stopped and rejects new work
    #[error("event processor stopped")]
    ProcessorStopped,

    /// The operation was cancelled before completion
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not complete within its deadline
    #[error("operation timed out")]
    Timeout,

    /// Entity serialization failure (programmer error in a model type)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Single-message validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        FabricError::Validation {
            errors: vec![message.into()],
        }
    }
}

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, FabricError>;

/// Run an operation under a deadline, mapping expiry to [`FabricError::Timeout`].
pub async fn with_deadline<F, T>(deadline: std::time::Duration, op: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(FabricError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_joins_errors() {
        let err = FabricError::Validation {
            errors: vec!["missing name".to_string(), "bad status".to_string()],
        };
        assert_eq!(err.to_string(), "validation failed: missing name; bad status");
    }

    #[test]
    fn test_pool_exhausted_display() {
        let err = FabricError::PoolExhausted { waited_ms: 250 };
        assert!(err.to_string().contains("250ms"));
    }

    #[tokio::test]
    async fn test_with_deadline_maps_expiry() {
        let slow = with_deadline(std::time::Duration::from_millis(10), async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(slow, Err(FabricError::Timeout)));

        let fast = with_deadline(std::time::Duration::from_millis(100), async { Ok(42) }).await;
        assert_eq!(fast.unwrap(), 42);
    }
}
