//! Change Log Records
//!
//! Every mutating engine operation emits a `NodeChange` describing what
//! changed, who changed it, and why. Records are append-only; the engine
//! writes them through the `ChangeLog` trait and never reads them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::Node;

/// The kind of mutation a change record describes. Wire names match the
/// stored audit documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    #[serde(rename = "add element")]
    AddElement,
    #[serde(rename = "remove element")]
    RemoveElement,
    #[serde(rename = "modify elements")]
    ModifyElements,
    #[serde(rename = "sort elements")]
    SortElements,
    #[serde(rename = "add collection")]
    AddCollection,
    #[serde(rename = "delete collection")]
    DeleteCollection,
    #[serde(rename = "edit collection")]
    EditCollection,
}

/// One audit record.
///
/// `previous_value` / `new_value` hold a JSON snapshot of the mutated
/// property (relation side, inheritance entry, ...); `full_node` is the node
/// after the mutation. `reasoning` is the caller-supplied justification,
/// mandatory for LLM-proposed edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChange {
    pub node_id: String,
    pub modified_by: String,
    pub modified_property: Option<String>,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub modified_at: DateTime<Utc>,
    pub change_type: ChangeType,
    pub full_node: Option<Node>,
    pub reasoning: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl NodeChange {
    /// A record with the required fields set and the optional ones empty.
    pub fn new(
        node_id: impl Into<String>,
        modified_by: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            modified_by: modified_by.into(),
            modified_property: None,
            previous_value: None,
            new_value: None,
            modified_at: Utc::now(),
            change_type,
            full_node: None,
            reasoning: None,
            details: None,
        }
    }
}
