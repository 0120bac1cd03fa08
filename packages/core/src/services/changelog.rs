//! Change Log Plumbing
//!
//! The engine appends a `NodeChange` after every successful mutation. The
//! sink is a trait so hosts can route records to their audit storage; the
//! `ChangeRecorder` wrapper applies the two engine-wide rules: entries from
//! the internal system actor are skipped, and sink failures never fail an
//! already-committed mutation (they are logged and dropped).

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::db::StoreError;
use crate::models::NodeChange;

/// Actor id used by internal maintenance flows. Mutations attributed to it
/// produce no change-log entries.
pub const SYSTEM_ACTOR: &str = "system";

/// Append-only audit sink.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Append one record, returning its id.
    async fn log(&self, change: NodeChange) -> Result<String, StoreError>;
}

/// The engine-facing wrapper around a `ChangeLog` sink.
#[derive(Clone)]
pub struct ChangeRecorder {
    sink: Arc<dyn ChangeLog>,
}

impl ChangeRecorder {
    pub fn new(sink: Arc<dyn ChangeLog>) -> Self {
        Self { sink }
    }

    /// Append a record unless it is attributed to [`SYSTEM_ACTOR`]. Sink
    /// failures are downgraded to warnings.
    pub async fn record(&self, change: NodeChange) -> Option<String> {
        if change.modified_by == SYSTEM_ACTOR {
            return None;
        }
        match self.sink.log(change).await {
            Ok(id) => Some(id),
            Err(error) => {
                warn!(%error, "change log append failed; mutation is already committed");
                None
            }
        }
    }
}

/// In-memory sink for tests and embedded use.
#[derive(Default)]
pub struct MemoryChangeLog {
    entries: RwLock<VecDeque<(String, NodeChange)>>,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<NodeChange> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    async fn log(&self, change: NodeChange) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.entries.write().await.push_back((id.clone(), change));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeType;

    #[tokio::test]
    async fn system_actor_entries_are_skipped() {
        let sink = Arc::new(MemoryChangeLog::new());
        let recorder = ChangeRecorder::new(sink.clone());

        let skipped = recorder
            .record(NodeChange::new("n1", SYSTEM_ACTOR, ChangeType::AddElement))
            .await;
        assert!(skipped.is_none());
        assert!(sink.is_empty().await);

        let logged = recorder
            .record(NodeChange::new("n1", "alice", ChangeType::AddElement))
            .await;
        assert!(logged.is_some());
        assert_eq!(sink.len().await, 1);
    }
}
