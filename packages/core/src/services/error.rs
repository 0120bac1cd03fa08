//! Service layer errors.
//!
//! One taxonomy for every engine operation. Every rejection happens before
//! any write; a returned error from a public operation means the graph was
//! not modified by it (cascade failures after the initiating commit are
//! logged, not returned).

use thiserror::Error;

use crate::db::StoreError;

#[derive(Error, Debug)]
pub enum OntologyError {
    /// A referenced node id does not exist in the store.
    #[error("Node not found: {id}")]
    NotFound { id: String },

    /// A referenced node exists but is soft-deleted.
    #[error("Node is deleted: {id}")]
    Deleted { id: String },

    /// Malformed input: blank ids, empty reference lists, unknown
    /// properties, blank actors.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The requested edge would close a cycle in an acyclic relation.
    #[error("Circular reference detected: {context}")]
    CircularReference { context: String },

    /// Removing the edge would leave a non-root node with no
    /// generalizations.
    #[error("Cannot remove the last generalization of node {id}")]
    LastGeneralization { id: String },

    /// The reserved `"main"` collection cannot be created, renamed, or
    /// deleted.
    #[error("Collection name is reserved: {0}")]
    ReservedCollection(String),

    /// A collection with this name already exists on the relation side.
    #[error("Collection '{name}' already exists in {relation}")]
    DuplicateCollection { name: String, relation: String },

    #[error("Collection '{name}' not found in {relation}")]
    CollectionNotFound { name: String, relation: String },

    /// Deletion requested for a collection that still holds references.
    #[error("Collection '{name}' is not empty ({count} references)")]
    CollectionNotEmpty { name: String, count: usize },

    /// Persistence failure, including a version conflict that survived the
    /// retry budget.
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    /// A post-commit cascade failed partway. Already-committed batches
    /// remain; `regenerate_inheritance` repairs idempotently.
    #[error("Cascade failed at node {node_id}: {reason}")]
    Cascade { node_id: String, reason: String },
}

impl OntologyError {
    pub fn not_found(id: impl Into<String>) -> Self {
        OntologyError::NotFound { id: id.into() }
    }

    pub fn deleted(id: impl Into<String>) -> Self {
        OntologyError::Deleted { id: id.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        OntologyError::Validation(message.into())
    }

    pub fn circular_reference(context: impl Into<String>) -> Self {
        OntologyError::CircularReference {
            context: context.into(),
        }
    }

    pub fn last_generalization(id: impl Into<String>) -> Self {
        OntologyError::LastGeneralization { id: id.into() }
    }

    pub fn duplicate_collection(name: impl Into<String>, relation: impl Into<String>) -> Self {
        OntologyError::DuplicateCollection {
            name: name.into(),
            relation: relation.into(),
        }
    }

    pub fn collection_not_found(name: impl Into<String>, relation: impl Into<String>) -> Self {
        OntologyError::CollectionNotFound {
            name: name.into(),
            relation: relation.into(),
        }
    }

    pub fn cascade(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        OntologyError::Cascade {
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }
}
