//! Data models for the ontology graph.

pub mod change;
pub mod node;

pub use change::{ChangeType, NodeChange};
pub use node::{
    contains_id, ensure_collection, ensure_main, find_collection, find_collection_mut,
    flatten_ids, remove_id, Collection, InheritanceEntry, InheritanceType, InheritedPart, Node,
    NodeRef, PropertyValue, ValidationError, IS_PART_OF_PROPERTY, MAIN_COLLECTION, PARTS_PROPERTY,
};
