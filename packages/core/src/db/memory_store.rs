//! In-Memory Graph Store
//!
//! Reference `GraphStore` backend over a `tokio::sync::RwLock`. Commit takes
//! the write lock, checks every expected version, and only then applies the
//! batch, so batches are atomic and conflicts are detected exactly as a
//! remote document store would report them. Used by the test suites and by
//! hosts embedding the engine without external storage.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{Node, IS_PART_OF_PROPERTY, PARTS_PROPERTY};

use super::error::StoreError;
use super::graph_store::{GraphStore, WriteBatch};

#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: RwLock<HashMap<String, Node>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node directly, outside the version protocol. Seeding only;
    /// the stored version is reset to 1.
    pub async fn insert(&self, mut node: Node) {
        node.version = 1;
        self.nodes.write().await.insert(node.id.clone(), node);
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get(&self, id: &str) -> Result<Option<Node>, StoreError> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<HashMap<String, Node>, StoreError> {
        let nodes = self.nodes.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| nodes.get(id).map(|n| (id.clone(), n.clone())))
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;

        // Validate the whole batch before touching anything.
        for write in batch.writes() {
            let current = nodes
                .get(&write.id)
                .ok_or_else(|| StoreError::unknown_node(&write.id))?;
            if current.version != write.version {
                return Err(StoreError::version_conflict(
                    &write.id,
                    write.version,
                    current.version,
                ));
            }
        }

        for mut write in batch.into_writes() {
            write.version += 1;
            nodes.insert(write.id.clone(), write);
        }
        Ok(())
    }

    async fn query_referencing(
        &self,
        property: &str,
        target_id: &str,
    ) -> Result<Vec<Node>, StoreError> {
        let nodes = self.nodes.read().await;
        let matches = nodes
            .values()
            .filter(|node| {
                let side: &[crate::models::Collection] = match property {
                    "specializations" => &node.specializations,
                    "generalizations" => &node.generalizations,
                    PARTS_PROPERTY => node.parts(),
                    IS_PART_OF_PROPERTY => node.is_part_of(),
                    _ => return false,
                };
                crate::models::contains_id(side, target_id)
            })
            .cloned()
            .collect();
        Ok(matches)
    }
}
