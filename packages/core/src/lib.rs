//! Ontology Core Consistency Engine
//!
//! This crate maintains the relationship and inheritance semantics of an
//! ontology knowledge graph: the is-a hierarchy, the part-whole relation,
//! per-property inheritance rules, and the derived inherited-parts cache.
//!
//! # Architecture
//!
//! - **Bidirectional edges**: specialization/generalization and parts/isPartOf
//!   are stored on both endpoints and kept in sync transactionally
//! - **Optimistic concurrency**: every node carries a version counter; writes
//!   are version-checked batches, conflicting operations re-run
//! - **Cascades after commit**: inheritance propagation runs after the
//!   initiating mutation and is idempotently repairable
//! - **Storage-agnostic**: all persistence goes through the [`db::GraphStore`]
//!   trait; an in-memory store ships for tests and embedded use
//!
//! # Modules
//!
//! - [`models`] - Data structures (Node, Collection, inheritance types)
//! - [`services`] - Business services (relationships, parts, inheritance)
//! - [`db`] - Storage abstraction, write batching, and the memory store

pub mod db;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use db::*;
pub use models::*;
pub use services::*;
