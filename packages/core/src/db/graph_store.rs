//! Graph Store Abstraction
//!
//! The engine never talks to a concrete database. All persistence goes
//! through the `GraphStore` trait: point reads, bulk reads, atomic
//! version-checked write batches, and one membership query shape.
//!
//! # Concurrency model
//!
//! Every node carries a `version` counter. A read returns the node at some
//! version; a commit succeeds only if every written node still has the
//! version it was read at, and bumps it by one. Readers never block writers.
//! The `Txn` helper bundles the read-then-commit discipline for a single
//! logical operation; conflicting operations lose the commit and re-run.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::models::Node;

use super::error::StoreError;

/// A set of node writes committed atomically. Each node's `version` field
/// holds the version it was read at; the store rejects the whole batch if
/// any node has moved on.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<Node>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a node. A later write for the same id replaces the earlier one.
    pub fn push(&mut self, node: Node) {
        if let Some(existing) = self.writes.iter_mut().find(|n| n.id == node.id) {
            *existing = node;
        } else {
            self.writes.push(node);
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Node] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<Node> {
        self.writes
    }
}

/// Persistence contract for the ontology graph.
///
/// Implementations must be safe to share across tasks (`Send + Sync`); the
/// engine holds them behind `Arc<dyn GraphStore>`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fetch a node by id.
    ///
    /// # Returns
    ///
    /// `Ok(Some(node))` when present (deleted nodes included — callers check
    /// the `deleted` flag), `Ok(None)` when the id is unknown.
    async fn get(&self, id: &str) -> Result<Option<Node>, StoreError>;

    /// Fetch several nodes at once. Unknown ids are simply absent from the
    /// result map.
    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Node>, StoreError>;

    /// Commit a batch atomically.
    ///
    /// # Errors
    ///
    /// - [`StoreError::VersionConflict`] if any written node's stored
    ///   version differs from the version it carries; nothing is written.
    /// - [`StoreError::UnknownNode`] if a write targets an id the store does
    ///   not hold.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Nodes whose named relation side or collection-valued property
    /// contains `target_id`. `property` is one of `"specializations"`,
    /// `"generalizations"`, `"parts"`, `"isPartOf"`.
    async fn query_referencing(
        &self,
        property: &str,
        target_id: &str,
    ) -> Result<Vec<Node>, StoreError>;
}

/// Read-set tracking for one logical read-modify-write operation.
///
/// Reads go through the transaction so each touched node is captured at a
/// single version; mutated copies are staged and committed in one atomic
/// batch. On [`StoreError::VersionConflict`] the caller re-runs the whole
/// operation from its reads.
pub struct Txn<'a> {
    store: &'a dyn GraphStore,
    batch: WriteBatch,
}

impl<'a> Txn<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
        }
    }

    /// Read a node through the transaction.
    pub async fn get(&self, id: &str) -> Result<Option<Node>, StoreError> {
        self.store.get(id).await
    }

    /// Stage a mutated node for commit. The node's `version` must still be
    /// the value it was read at.
    pub fn stage(&mut self, node: Node) {
        self.batch.push(node);
    }

    pub fn staged(&self) -> usize {
        self.batch.len()
    }

    /// Commit all staged writes atomically.
    pub async fn commit(self) -> Result<(), StoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.store.commit(self.batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_batch_deduplicates_by_id() {
        let mut batch = WriteBatch::new();
        let mut a = Node::new_with_id("a", "first".to_string());
        batch.push(a.clone());
        a.title = "second".to_string();
        batch.push(a);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.writes()[0].title, "second");
    }
}
