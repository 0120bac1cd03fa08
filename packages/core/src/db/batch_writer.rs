//! Batched Cascade Writes
//!
//! Inheritance and parts-inheritance cascades can touch thousands of
//! descendants. They are not one transaction: writes are accumulated and
//! committed in slices so no single commit exceeds the store's batch limit.
//! Each `BatchWriter` value owns its own counter; concurrent cascades never
//! share flush state.

use tracing::debug;

use crate::models::Node;

use super::error::StoreError;
use super::graph_store::{GraphStore, WriteBatch};

/// Maximum writes per committed batch. Mirrors the 500-write ceiling of
/// batched document stores with headroom for bookkeeping writes.
pub const MAX_BATCH_WRITES: usize = 400;

/// Accumulates node writes and commits automatically whenever the pending
/// slice reaches [`MAX_BATCH_WRITES`]. Callers must `flush` at the end of
/// the cascade to commit the remainder.
pub struct BatchWriter<'a> {
    store: &'a dyn GraphStore,
    pending: WriteBatch,
    committed: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn GraphStore) -> Self {
        Self {
            store,
            pending: WriteBatch::new(),
            committed: 0,
        }
    }

    /// Stage one node write, committing the pending slice first if it is
    /// full. The node's `version` must be the version it was read at.
    pub async fn write(&mut self, node: Node) -> Result<(), StoreError> {
        if self.pending.len() >= MAX_BATCH_WRITES {
            self.flush().await?;
        }
        self.pending.push(node);
        Ok(())
    }

    /// Commit all pending writes. No-op when nothing is pending.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        let size = batch.len();
        self.store.commit(batch).await?;
        self.committed += size;
        debug!(batch_size = size, total = self.committed, "cascade batch committed");
        Ok(())
    }

    /// Total writes committed so far (excludes pending).
    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
