//! Storage-layer error type shared across store implementations.

use thiserror::Error;

/// Errors surfaced by `WorkflowStore` and the other persistence ports.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}
