//! Node Data Structures
//!
//! This module defines the core `Node` struct and the relationship/inheritance
//! types attached to it: named ordered collections of node references, the
//! per-property inheritance map, and the derived parts-inheritance cache.
//!
//! # Architecture
//!
//! - **Bidirectional edges**: specialization/generalization and parts/isPartOf
//!   are each stored on both endpoints; the services keep the two sides in sync
//! - **Named collections**: every relation side is a list of `Collection`s; the
//!   reserved `"main"` collection always exists and is the default target
//! - **Closed property values**: `PropertyValue` is an exhaustive sum over the
//!   supported shapes, so inheritance-rule dispatch cannot meet an unknown case
//!
//! # Examples
//!
//! ```rust
//! use ontology_core::models::{Node, NodeRef};
//!
//! let mut task = Node::new("Prepare a meal".to_string());
//! task.parts_mut()[0].nodes.push(NodeRef::new("ingredient-1"));
//! assert!(task.parts()[0].contains("ingredient-1"));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Reserved collection name. Always present on every relation side, never
/// renamed or deleted. Reservation is enforced case-insensitively.
pub const MAIN_COLLECTION: &str = "main";

/// Property key holding the has-a children ("parts") collections.
pub const PARTS_PROPERTY: &str = "parts";

/// Property key holding the inverse has-a ("isPartOf") collections.
pub const IS_PART_OF_PROPERTY: &str = "isPartOf";

/// Default version value for serde deserialization (version 1)
fn default_version() -> i64 {
    1
}

/// Validation errors for Node operations
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid node ID format: {0}")]
    InvalidId(String),

    #[error("Property is not collection-valued: {0}")]
    NotCollections(String),
}

/// A reference to another node held inside a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub id: String,
}

impl NodeRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A named, ordered group of node references.
///
/// Ids inside one collection are unique; order is display order and carries
/// no semantic weight. The same id may appear in at most one collection of a
/// given relation side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub collection_name: String,
    pub nodes: Vec<NodeRef>,
}

impl Collection {
    /// An empty reserved `"main"` collection.
    pub fn main() -> Self {
        Self {
            collection_name: MAIN_COLLECTION.to_string(),
            nodes: Vec::new(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            collection_name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|r| r.id == id)
    }

    pub fn is_main(&self) -> bool {
        self.collection_name.eq_ignore_ascii_case(MAIN_COLLECTION)
    }
}

/// How a property on a specialization relates to the same property on its
/// generalizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InheritanceType {
    /// Value is always local; never overwritten by cascades.
    NeverInherit,
    /// Value always mirrors the source; local edits are overwritten.
    AlwaysInherit,
    /// Default. Mirrors the source until the first local edit, after which
    /// the ref becomes null and the value stays local.
    InheritUnlessAlreadyOverRidden,
    /// Changes upstream are surfaced for human review; automated cascades
    /// never touch the value.
    InheritAfterReview,
}

/// Per-property inheritance state: where the current value comes from
/// (`None` = locally owned) and the rule governing future propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritanceEntry {
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub inheritance_type: InheritanceType,
}

impl InheritanceEntry {
    pub fn new(reference: Option<String>, inheritance_type: InheritanceType) -> Self {
        Self {
            reference,
            inheritance_type,
        }
    }

    /// The default state for a freshly materialized property.
    pub fn default_from(reference: Option<String>) -> Self {
        Self::new(reference, InheritanceType::InheritUnlessAlreadyOverRidden)
    }
}

/// One entry of the derived `inheritanceParts` cache: which ancestor
/// ultimately contributed an inherited part. The title is denormalized for
/// display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritedPart {
    pub inherited_from_id: String,
    pub inherited_from_title: String,
}

/// A property value. The set of shapes is closed on purpose: every consumer
/// matches exhaustively and the compiler flags any future extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Flag(bool),
    Number(f64),
    Text(String),
    Collections(Vec<Collection>),
}

impl PropertyValue {
    /// An empty collection-valued property: just the reserved `"main"`.
    pub fn empty_collections() -> Self {
        PropertyValue::Collections(vec![Collection::main()])
    }

    pub fn is_collections(&self) -> bool {
        matches!(self, PropertyValue::Collections(_))
    }

    pub fn as_collections(&self) -> Option<&Vec<Collection>> {
        match self {
            PropertyValue::Collections(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_collections_mut(&mut self) -> Option<&mut Vec<Collection>> {
        match self {
            PropertyValue::Collections(c) => Some(c),
            _ => None,
        }
    }
}

/// A node of the knowledge graph.
///
/// # Fields
///
/// - `id`: unique identifier (UUID)
/// - `title`: display name
/// - `deleted`: soft-delete flag; deleted nodes are never edited, and stale
///   references to them are skipped and lazily cleaned
/// - `version`: optimistic concurrency counter, bumped by the store on every
///   committed write
/// - `properties`: domain payload; the collection-valued `parts` and
///   `isPartOf` properties always exist
/// - `inheritance`: per-property inheritance state, keyed by property name
/// - `inheritance_parts`: derived cache of parts reachable through the
///   generalization chain, keyed by part id
/// - `specializations` / `generalizations`: the is-a relation, both sides
///   stored as named collections
/// - `text_value`: free-text side-car per property; removed together with
///   the property when a cascade deletes it
/// - `contributors`: deduplicated editor identifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub deleted: bool,

    /// Optimistic concurrency control version (incremented on each update)
    #[serde(default = "default_version")]
    pub version: i64,

    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,

    #[serde(default)]
    pub inheritance: BTreeMap<String, InheritanceEntry>,

    #[serde(default)]
    pub inheritance_parts: BTreeMap<String, InheritedPart>,

    #[serde(default)]
    pub specializations: Vec<Collection>,

    #[serde(default)]
    pub generalizations: Vec<Collection>,

    #[serde(default)]
    pub text_value: BTreeMap<String, String>,

    #[serde(default)]
    pub contributors: Vec<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,
}

impl Node {
    /// Create a new node with a generated UUID, empty relation sides, and
    /// the `parts` / `isPartOf` collection properties materialized.
    pub fn new(title: String) -> Self {
        let now = Utc::now();
        let mut properties = BTreeMap::new();
        properties.insert(
            PARTS_PROPERTY.to_string(),
            PropertyValue::empty_collections(),
        );
        properties.insert(
            IS_PART_OF_PROPERTY.to_string(),
            PropertyValue::empty_collections(),
        );
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            deleted: false,
            version: 1,
            properties,
            inheritance: BTreeMap::new(),
            inheritance_parts: BTreeMap::new(),
            specializations: vec![Collection::main()],
            generalizations: vec![Collection::main()],
            text_value: BTreeMap::new(),
            contributors: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Create a node with a caller-provided id (tests, imports).
    pub fn new_with_id(id: impl Into<String>, title: String) -> Self {
        let mut node = Self::new(title);
        node.id = id.into();
        node
    }

    /// The `parts` collections. Missing or non-collection values read as
    /// empty.
    pub fn parts(&self) -> &[Collection] {
        self.properties
            .get(PARTS_PROPERTY)
            .and_then(|v| v.as_collections())
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    /// Mutable access to the `parts` collections, materializing the property
    /// (with an empty `"main"`) if absent.
    pub fn parts_mut(&mut self) -> &mut Vec<Collection> {
        self.collection_property_mut(PARTS_PROPERTY)
    }

    pub fn is_part_of(&self) -> &[Collection] {
        self.properties
            .get(IS_PART_OF_PROPERTY)
            .and_then(|v| v.as_collections())
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_part_of_mut(&mut self) -> &mut Vec<Collection> {
        self.collection_property_mut(IS_PART_OF_PROPERTY)
    }

    fn collection_property_mut(&mut self, property: &str) -> &mut Vec<Collection> {
        let value = self
            .properties
            .entry(property.to_string())
            .or_insert_with(PropertyValue::empty_collections);
        if !value.is_collections() {
            *value = PropertyValue::empty_collections();
        }
        match value {
            PropertyValue::Collections(c) => c,
            _ => unreachable!("collection property was just materialized"),
        }
    }

    /// Record an editor on the node, keeping the list deduplicated.
    pub fn add_contributor(&mut self, actor: &str) {
        if !self.contributors.iter().any(|c| c == actor) {
            self.contributors.push(actor.to_string());
        }
    }

    /// Bump the modification timestamp.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// All ids across a relation side, in collection order.
pub fn flatten_ids(collections: &[Collection]) -> Vec<String> {
    collections
        .iter()
        .flat_map(|c| c.nodes.iter().map(|r| r.id.clone()))
        .collect()
}

/// True if any collection on the side holds the id.
pub fn contains_id(collections: &[Collection], id: &str) -> bool {
    collections.iter().any(|c| c.contains(id))
}

pub fn find_collection<'a>(collections: &'a [Collection], name: &str) -> Option<&'a Collection> {
    collections.iter().find(|c| c.collection_name == name)
}

pub fn find_collection_mut<'a>(
    collections: &'a mut [Collection],
    name: &str,
) -> Option<&'a mut Collection> {
    collections.iter_mut().find(|c| c.collection_name == name)
}

/// Make sure the reserved `"main"` collection exists, inserting it first if
/// missing.
pub fn ensure_main(collections: &mut Vec<Collection>) {
    if !collections.iter().any(|c| c.is_main()) {
        collections.insert(0, Collection::main());
    }
}

/// Get-or-create a collection by name. `"main"` is created at the front,
/// other collections at the back.
pub fn ensure_collection<'a>(
    collections: &'a mut Vec<Collection>,
    name: &str,
) -> &'a mut Collection {
    if let Some(pos) = collections.iter().position(|c| c.collection_name == name) {
        return &mut collections[pos];
    }
    if name.eq_ignore_ascii_case(MAIN_COLLECTION) {
        collections.insert(0, Collection::main());
        return &mut collections[0];
    }
    collections.push(Collection::named(name));
    let last = collections.len() - 1;
    &mut collections[last]
}

/// Remove an id wherever it appears on the side. Collections emptied by the
/// removal are dropped, except the reserved `"main"`. Returns true if
/// anything was removed.
pub fn remove_id(collections: &mut Vec<Collection>, id: &str) -> bool {
    let mut removed = false;
    for collection in collections.iter_mut() {
        let before = collection.nodes.len();
        collection.nodes.retain(|r| r.id != id);
        removed |= collection.nodes.len() != before;
    }
    collections.retain(|c| c.is_main() || !c.nodes.is_empty());
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_node_materializes_parts_properties() {
        let node = Node::new("Activity".to_string());
        assert_eq!(node.parts().len(), 1);
        assert!(node.parts()[0].is_main());
        assert_eq!(node.is_part_of().len(), 1);
        assert_eq!(node.version, 1);
    }

    #[test]
    fn node_round_trips_with_camel_case_wire_names() {
        let mut node = Node::new_with_id("n1", "Task".to_string());
        node.inheritance.insert(
            "priority".to_string(),
            InheritanceEntry::default_from(Some("parent-1".to_string())),
        );
        node.inheritance_parts.insert(
            "p1".to_string(),
            InheritedPart {
                inherited_from_id: "g1".to_string(),
                inherited_from_title: "General task".to_string(),
            },
        );

        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(
            value["inheritance"]["priority"]["inheritanceType"],
            json!("inheritUnlessAlreadyOverRidden")
        );
        assert_eq!(value["inheritance"]["priority"]["ref"], json!("parent-1"));
        assert_eq!(
            value["inheritanceParts"]["p1"]["inheritedFromTitle"],
            json!("General task")
        );

        let back: Node = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn property_value_deserializes_each_shape() {
        let text: PropertyValue = serde_json::from_value(json!("hello")).unwrap();
        assert_eq!(text, PropertyValue::Text("hello".to_string()));

        let flag: PropertyValue = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(flag, PropertyValue::Flag(true));

        let number: PropertyValue = serde_json::from_value(json!(2.5)).unwrap();
        assert_eq!(number, PropertyValue::Number(2.5));

        let collections: PropertyValue =
            serde_json::from_value(json!([{ "collectionName": "main", "nodes": [{ "id": "a" }] }]))
                .unwrap();
        let inner = collections.as_collections().unwrap();
        assert!(inner[0].contains("a"));
    }

    #[test]
    fn remove_id_drops_emptied_collections_but_keeps_main() {
        let mut side = vec![Collection::main(), Collection::named("acts")];
        side[0].nodes.push(NodeRef::new("a"));
        side[1].nodes.push(NodeRef::new("b"));

        assert!(remove_id(&mut side, "b"));
        assert_eq!(side.len(), 1);
        assert!(side[0].is_main());

        assert!(remove_id(&mut side, "a"));
        assert_eq!(side.len(), 1, "main survives being emptied");
        assert!(side[0].nodes.is_empty());
    }

    #[test]
    fn ensure_collection_puts_main_first() {
        let mut side = vec![Collection::named("acts")];
        ensure_collection(&mut side, "main");
        assert!(side[0].is_main());
    }

    #[test]
    fn contributors_are_deduplicated() {
        let mut node = Node::new("n".to_string());
        node.add_contributor("alice");
        node.add_contributor("alice");
        node.add_contributor("bob");
        assert_eq!(node.contributors, vec!["alice", "bob"]);
    }
}
