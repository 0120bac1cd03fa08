//! Storage layer errors.

use thiserror::Error;

/// Errors surfaced by `GraphStore` implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An expected-version check failed during commit. The whole batch was
    /// rejected; nothing was written.
    #[error("Version conflict on node {node_id}: expected {expected}, found {actual}")]
    VersionConflict {
        node_id: String,
        expected: i64,
        actual: i64,
    },

    /// A write referenced a node the store does not hold.
    #[error("Unknown node in write batch: {id}")]
    UnknownNode { id: String },

    /// Backend failure (I/O, serialization, connectivity).
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn version_conflict(node_id: impl Into<String>, expected: i64, actual: i64) -> Self {
        StoreError::VersionConflict {
            node_id: node_id.into(),
            expected,
            actual,
        }
    }

    pub fn unknown_node(id: impl Into<String>) -> Self {
        StoreError::UnknownNode { id: id.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend(message.into())
    }
}
