//! Part-Whole Manager
//!
//! Maintains the has-a relation: the `parts` and `isPartOf` collection
//! properties on both endpoints of every edge. The relation is an acyclic
//! DAG, independent of the is-a hierarchy, with no minimum-cardinality
//! constraint. Both sides of every mutation are written in one transaction
//! and both sides are change-logged.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::error;

use crate::db::{GraphStore, Txn};
use crate::models::{
    contains_id, ensure_collection, find_collection, find_collection_mut, flatten_ids,
    ChangeType, Collection, Node, NodeChange, NodeRef, PropertyValue, IS_PART_OF_PROPERTY,
    MAIN_COLLECTION, PARTS_PROPERTY,
};

use super::changelog::{ChangeLog, ChangeRecorder};
use super::error::OntologyError;
use super::parts_inheritance::PartsInheritanceService;
use super::{require_non_blank, with_retry};

/// Which side of the has-a relation an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartsSide {
    Parts,
    IsPartOf,
}

impl PartsSide {
    pub fn property(self) -> &'static str {
        match self {
            PartsSide::Parts => PARTS_PROPERTY,
            PartsSide::IsPartOf => IS_PART_OF_PROPERTY,
        }
    }
}

pub struct PartsService {
    store: Arc<dyn GraphStore>,
    changelog: ChangeRecorder,
    parts_inheritance: PartsInheritanceService,
}

impl PartsService {
    pub fn new(store: Arc<dyn GraphStore>, changelog: Arc<dyn ChangeLog>) -> Self {
        let recorder = ChangeRecorder::new(changelog);
        Self {
            store: store.clone(),
            changelog: recorder.clone(),
            parts_inheritance: PartsInheritanceService::new(store, recorder),
        }
    }

    // --- Edge mutations ---------------------------------------------------

    /// Add direct parts to a container node. The inverse `isPartOf` edge is
    /// written on every part in the same transaction; refs already present
    /// on the side are skipped, and an all-duplicate request is a no-op.
    ///
    /// A container in explicit-source parts mode leaves that mode first:
    /// the inherited set is materialized so nothing is silently lost.
    pub async fn add_parts(
        &self,
        node_id: &str,
        parts: &[NodeRef],
        actor: &str,
        reason: &str,
        collection_name: Option<&str>,
    ) -> Result<Node, OntologyError> {
        self.validate_edge_input(node_id, parts, actor)?;
        let collection_name = collection_name.unwrap_or(MAIN_COLLECTION);

        let node = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous_parts = node.parts().to_vec();

            let mut part_nodes: Vec<Node> = Vec::new();
            for part_ref in parts {
                let part = self.read_active(&txn, &part_ref.id).await?;
                part_nodes.push(part);
            }

            for part in &part_nodes {
                if self.would_create_part_cycle(&txn, node_id, &part.id).await? {
                    return Err(OntologyError::circular_reference(format!(
                        "adding {} as a part of {} closes a parts cycle",
                        part.id, node_id
                    )));
                }
            }

            let existing: HashSet<String> = flatten_ids(node.parts()).into_iter().collect();
            let added: Vec<String> = parts
                .iter()
                .map(|r| r.id.clone())
                .filter(|id| !existing.contains(id))
                .collect();
            if added.is_empty() {
                return Ok(node);
            }

            // Direct additions are incompatible with explicit-source mode:
            // materialize the inherited set in the same transaction, so a
            // rejected add leaves the mode untouched.
            let broken_ref = self
                .parts_inheritance
                .handle_add_parts_with_inheritance_ref(&mut node)
                .await?;

            let target = ensure_collection(node.parts_mut(), collection_name);
            for id in &added {
                target.nodes.push(NodeRef::new(id));
            }
            // A freshly direct part is no longer inherited.
            for id in &added {
                node.inheritance_parts.remove(id);
            }
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());

            let mut part_changes: Vec<NodeChange> = Vec::new();
            for mut part in part_nodes {
                if !added.contains(&part.id) {
                    continue;
                }
                let previous = part.is_part_of().to_vec();
                let side = part.is_part_of_mut();
                if !contains_id(side, node_id) {
                    ensure_collection(side, MAIN_COLLECTION)
                        .nodes
                        .push(NodeRef::new(node_id));
                    part.add_contributor(actor);
                    part.touch();
                    part_changes.push(self.edge_change(
                        &part,
                        actor,
                        reason,
                        ChangeType::AddElement,
                        IS_PART_OF_PROPERTY,
                        &previous,
                        part.is_part_of(),
                    ));
                    txn.stage(part.clone());
                }
            }

            txn.commit().await?;

            if let Some(previous_ref) = &broken_ref {
                let mut change = NodeChange::new(node_id, actor, ChangeType::ModifyElements);
                change.modified_property = Some("inheritance.parts.ref".to_string());
                change.previous_value = serde_json::to_value(previous_ref).ok();
                change.new_value = Some(serde_json::Value::Null);
                change.full_node = Some(node.clone());
                change.reasoning = Some(reason.to_string());
                self.changelog.record(change).await;
            }
            self.changelog
                .record(self.edge_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::AddElement,
                    PARTS_PROPERTY,
                    &previous_parts,
                    node.parts(),
                ))
                .await;
            for change in part_changes {
                self.changelog.record(change).await;
            }

            Ok(node)
        })
        .await?;

        if let Err(err) = self.parts_inheritance.propagate_to_specializations(node_id).await {
            error!(node_id, %err, "parts inheritance propagation failed after add_parts");
        }
        Ok(node)
    }

    /// Remove direct parts from a container node, cleaning the inverse edge
    /// on each part in the same transaction. Emptied collections other than
    /// `"main"` are dropped.
    pub async fn remove_parts(
        &self,
        node_id: &str,
        parts: &[NodeRef],
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        self.validate_edge_input(node_id, parts, actor)?;

        let node = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous_parts = node.parts().to_vec();

            let side = node.parts_mut();
            let mut removed: Vec<String> = Vec::new();
            for part_ref in parts {
                if crate::models::remove_id(side, &part_ref.id) {
                    removed.push(part_ref.id.clone());
                }
            }
            if removed.is_empty() {
                return Ok(node);
            }
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());

            let mut part_changes: Vec<NodeChange> = Vec::new();
            for id in &removed {
                // Stale references to missing nodes are skipped silently.
                let Some(mut part) = txn.get(id).await? else {
                    continue;
                };
                let previous = part.is_part_of().to_vec();
                if crate::models::remove_id(part.is_part_of_mut(), node_id) {
                    part.add_contributor(actor);
                    part.touch();
                    part_changes.push(self.edge_change(
                        &part,
                        actor,
                        reason,
                        ChangeType::RemoveElement,
                        IS_PART_OF_PROPERTY,
                        &previous,
                        part.is_part_of(),
                    ));
                    txn.stage(part);
                }
            }

            txn.commit().await?;

            self.changelog
                .record(self.edge_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::RemoveElement,
                    PARTS_PROPERTY,
                    &previous_parts,
                    node.parts(),
                ))
                .await;
            for change in part_changes {
                self.changelog.record(change).await;
            }

            Ok(node)
        })
        .await?;

        // A removed direct part may be visible again through a
        // generalization; then refresh the subtree.
        if let Err(err) = self.parts_inheritance.refresh(node_id).await {
            error!(node_id, %err, "parts inheritance refresh failed after remove_parts");
        }
        if let Err(err) = self.parts_inheritance.propagate_to_specializations(node_id).await {
            error!(node_id, %err, "parts inheritance propagation failed after remove_parts");
        }
        Ok(node)
    }

    /// Mark this node as a part of the given container nodes. The inverse
    /// direction of [`add_parts`](Self::add_parts): the containers' `parts`
    /// sides gain this node in their `"main"` collection.
    pub async fn add_is_part_of(
        &self,
        node_id: &str,
        containers: &[NodeRef],
        actor: &str,
        reason: &str,
        collection_name: Option<&str>,
    ) -> Result<Node, OntologyError> {
        self.validate_edge_input(node_id, containers, actor)?;
        let collection_name = collection_name.unwrap_or(MAIN_COLLECTION);

        let (node, touched) = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous = node.is_part_of().to_vec();

            let mut container_nodes: Vec<Node> = Vec::new();
            for container_ref in containers {
                let container = self.read_active(&txn, &container_ref.id).await?;
                if self
                    .would_create_part_cycle(&txn, &container.id, node_id)
                    .await?
                {
                    return Err(OntologyError::circular_reference(format!(
                        "making {} a part of {} closes a parts cycle",
                        node_id, container.id
                    )));
                }
                container_nodes.push(container);
            }

            let side = node.is_part_of_mut();
            let existing: HashSet<String> = flatten_ids(side).into_iter().collect();
            let added: Vec<String> = containers
                .iter()
                .map(|r| r.id.clone())
                .filter(|id| !existing.contains(id))
                .collect();
            if added.is_empty() {
                return Ok((node, Vec::new()));
            }

            let target = ensure_collection(side, collection_name);
            for id in &added {
                target.nodes.push(NodeRef::new(id));
            }
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());

            let mut container_changes: Vec<NodeChange> = Vec::new();
            let mut touched: Vec<String> = Vec::new();
            for mut container in container_nodes {
                if !added.contains(&container.id) {
                    continue;
                }
                let previous_parts = container.parts().to_vec();
                let side = container.parts_mut();
                if !contains_id(side, node_id) {
                    ensure_collection(side, MAIN_COLLECTION)
                        .nodes
                        .push(NodeRef::new(node_id));
                    container.inheritance_parts.remove(node_id);
                    container.add_contributor(actor);
                    container.touch();
                    touched.push(container.id.clone());
                    container_changes.push(self.edge_change(
                        &container,
                        actor,
                        reason,
                        ChangeType::AddElement,
                        PARTS_PROPERTY,
                        &previous_parts,
                        container.parts(),
                    ));
                    txn.stage(container.clone());
                }
            }

            txn.commit().await?;

            self.changelog
                .record(self.edge_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::AddElement,
                    IS_PART_OF_PROPERTY,
                    &previous,
                    node.is_part_of(),
                ))
                .await;
            for change in container_changes {
                self.changelog.record(change).await;
            }

            Ok((node, touched))
        })
        .await?;

        for container_id in touched {
            if let Err(err) = self
                .parts_inheritance
                .propagate_to_specializations(&container_id)
                .await
            {
                error!(container_id, %err, "parts inheritance propagation failed after add_is_part_of");
            }
        }
        Ok(node)
    }

    /// Remove isPartOf relationships, cleaning the containers' `parts`
    /// sides in the same transaction.
    pub async fn remove_is_part_of(
        &self,
        node_id: &str,
        containers: &[NodeRef],
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        self.validate_edge_input(node_id, containers, actor)?;

        let (node, touched) = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous = node.is_part_of().to_vec();

            let side = node.is_part_of_mut();
            let mut removed: Vec<String> = Vec::new();
            for container_ref in containers {
                if crate::models::remove_id(side, &container_ref.id) {
                    removed.push(container_ref.id.clone());
                }
            }
            if removed.is_empty() {
                return Ok((node, Vec::new()));
            }
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());

            let mut container_changes: Vec<NodeChange> = Vec::new();
            let mut touched: Vec<String> = Vec::new();
            for id in &removed {
                let Some(mut container) = txn.get(id).await? else {
                    continue;
                };
                let previous_parts = container.parts().to_vec();
                if crate::models::remove_id(container.parts_mut(), node_id) {
                    container.add_contributor(actor);
                    container.touch();
                    touched.push(container.id.clone());
                    container_changes.push(self.edge_change(
                        &container,
                        actor,
                        reason,
                        ChangeType::RemoveElement,
                        PARTS_PROPERTY,
                        &previous_parts,
                        container.parts(),
                    ));
                    txn.stage(container);
                }
            }

            txn.commit().await?;

            self.changelog
                .record(self.edge_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::RemoveElement,
                    IS_PART_OF_PROPERTY,
                    &previous,
                    node.is_part_of(),
                ))
                .await;
            for change in container_changes {
                self.changelog.record(change).await;
            }

            Ok((node, touched))
        })
        .await?;

        for container_id in touched {
            if let Err(err) = self.parts_inheritance.refresh(&container_id).await {
                error!(container_id, %err, "parts inheritance refresh failed after remove_is_part_of");
            }
            if let Err(err) = self
                .parts_inheritance
                .propagate_to_specializations(&container_id)
                .await
            {
                error!(container_id, %err, "parts inheritance propagation failed after remove_is_part_of");
            }
        }
        Ok(node)
    }

    // --- Collection management --------------------------------------------

    /// Create an empty named collection on one side of the has-a relation.
    pub async fn create_collection(
        &self,
        node_id: &str,
        side: PartsSide,
        collection_name: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(collection_name, "collection name")?;
        require_non_blank(actor, "actor")?;
        if collection_name.eq_ignore_ascii_case(MAIN_COLLECTION) {
            return Err(OntologyError::ReservedCollection(
                collection_name.to_string(),
            ));
        }

        with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let collections = self.side_mut(&mut node, side);
            if find_collection(collections, collection_name).is_some() {
                return Err(OntologyError::duplicate_collection(
                    collection_name,
                    side.property(),
                ));
            }
            let previous = collections.to_vec();
            collections.push(Collection::named(collection_name));
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            self.changelog
                .record(self.edge_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::AddCollection,
                    side.property(),
                    &previous,
                    self.side_ref(&node, side),
                ))
                .await;
            Ok(node)
        })
        .await
    }

    /// Delete an empty named collection. `"main"` is reserved and non-empty
    /// collections are rejected.
    pub async fn delete_collection(
        &self,
        node_id: &str,
        side: PartsSide,
        collection_name: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(collection_name, "collection name")?;
        require_non_blank(actor, "actor")?;
        if collection_name.eq_ignore_ascii_case(MAIN_COLLECTION) {
            return Err(OntologyError::ReservedCollection(
                collection_name.to_string(),
            ));
        }

        with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let collections = self.side_mut(&mut node, side);
            let index = collections
                .iter()
                .position(|c| c.collection_name == collection_name)
                .ok_or_else(|| {
                    OntologyError::collection_not_found(collection_name, side.property())
                })?;
            let count = collections[index].nodes.len();
            if count > 0 {
                return Err(OntologyError::CollectionNotEmpty {
                    name: collection_name.to_string(),
                    count,
                });
            }
            let previous = collections.to_vec();
            collections.remove(index);
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            self.changelog
                .record(self.edge_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::DeleteCollection,
                    side.property(),
                    &previous,
                    self.side_ref(&node, side),
                ))
                .await;
            Ok(node)
        })
        .await
    }

    /// Reorder the references inside one collection. `ordered_ids` must be
    /// a permutation of the collection's current membership.
    pub async fn reorder(
        &self,
        node_id: &str,
        side: PartsSide,
        collection_name: &str,
        ordered_ids: &[String],
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(actor, "actor")?;

        with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let collections = self.side_mut(&mut node, side);
            let previous = collections.to_vec();
            let collection =
                find_collection_mut(collections, collection_name).ok_or_else(|| {
                    OntologyError::collection_not_found(collection_name, side.property())
                })?;

            let current: HashSet<&str> = collection.nodes.iter().map(|r| r.id.as_str()).collect();
            let requested: HashSet<&str> = ordered_ids.iter().map(|s| s.as_str()).collect();
            if current != requested || ordered_ids.len() != collection.nodes.len() {
                return Err(OntologyError::validation(
                    "new order must be a permutation of the collection's members",
                ));
            }

            collection.nodes = ordered_ids.iter().map(NodeRef::new).collect();
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            self.changelog
                .record(self.edge_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::SortElements,
                    side.property(),
                    &previous,
                    self.side_ref(&node, side),
                ))
                .await;
            Ok(node)
        })
        .await
    }

    // --- Repair -----------------------------------------------------------

    /// Repair edge symmetry around one node: every id on its `parts` side
    /// gains the inverse `isPartOf` reference and every id on its `isPartOf`
    /// side gains the inverse `parts` reference, each in the counterpart's
    /// `"main"` collection. Intact edges and missing nodes are skipped, and
    /// nothing is change-logged; this is the edge-level counterpart of
    /// [`PartsInheritanceService::refresh`] for interrupted cascades.
    pub async fn sync_part_relations(&self, node_id: &str) -> Result<(), OntologyError> {
        require_non_blank(node_id, "node id")?;

        let repaired_containers: Vec<String> = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let Some(node) = txn.get(node_id).await? else {
                return Ok(Vec::new());
            };

            for part_id in flatten_ids(node.parts()) {
                let Some(mut part) = txn.get(&part_id).await? else {
                    continue;
                };
                if !contains_id(part.is_part_of(), node_id) {
                    ensure_collection(part.is_part_of_mut(), MAIN_COLLECTION)
                        .nodes
                        .push(NodeRef::new(node_id));
                    part.touch();
                    txn.stage(part);
                }
            }

            let mut repaired: Vec<String> = Vec::new();
            for container_id in flatten_ids(node.is_part_of()) {
                let Some(mut container) = txn.get(&container_id).await? else {
                    continue;
                };
                if !contains_id(container.parts(), node_id) {
                    ensure_collection(container.parts_mut(), MAIN_COLLECTION)
                        .nodes
                        .push(NodeRef::new(node_id));
                    container.inheritance_parts.remove(node_id);
                    container.touch();
                    repaired.push(container.id.clone());
                    txn.stage(container);
                }
            }

            txn.commit().await?;
            Ok(repaired)
        })
        .await?;

        for container_id in repaired_containers {
            if let Err(err) = self
                .parts_inheritance
                .propagate_to_specializations(&container_id)
                .await
            {
                error!(container_id, %err, "parts inheritance propagation failed after sync");
            }
        }
        Ok(())
    }

    // --- Helpers ----------------------------------------------------------

    /// True if making `part_id` a part of `container_id` closes a cycle in
    /// the parts DAG: the container must not be reachable by descending the
    /// part's own parts. Self-loops count as cycles.
    async fn would_create_part_cycle(
        &self,
        txn: &Txn<'_>,
        container_id: &str,
        part_id: &str,
    ) -> Result<bool, OntologyError> {
        if container_id == part_id {
            return Ok(true);
        }
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = vec![part_id.to_string()];
        while let Some(current) = stack.pop() {
            if current == container_id {
                return Ok(true);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(node) = txn.get(&current).await? else {
                continue;
            };
            for child in flatten_ids(node.parts()) {
                stack.push(child);
            }
        }
        Ok(false)
    }

    async fn read_active(&self, txn: &Txn<'_>, id: &str) -> Result<Node, OntologyError> {
        let node = txn
            .get(id)
            .await?
            .ok_or_else(|| OntologyError::not_found(id))?;
        if node.deleted {
            return Err(OntologyError::deleted(id));
        }
        Ok(node)
    }

    fn validate_edge_input(
        &self,
        node_id: &str,
        refs: &[NodeRef],
        actor: &str,
    ) -> Result<(), OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(actor, "actor")?;
        if refs.is_empty() {
            return Err(OntologyError::validation(
                "at least one node reference must be provided",
            ));
        }
        Ok(())
    }

    fn side_mut<'a>(&self, node: &'a mut Node, side: PartsSide) -> &'a mut Vec<Collection> {
        match side {
            PartsSide::Parts => node.parts_mut(),
            PartsSide::IsPartOf => node.is_part_of_mut(),
        }
    }

    fn side_ref<'a>(&self, node: &'a Node, side: PartsSide) -> &'a [Collection] {
        match side {
            PartsSide::Parts => node.parts(),
            PartsSide::IsPartOf => node.is_part_of(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn edge_change(
        &self,
        node: &Node,
        actor: &str,
        reason: &str,
        change_type: ChangeType,
        property: &str,
        previous: &[Collection],
        current: &[Collection],
    ) -> NodeChange {
        let mut change = NodeChange::new(&node.id, actor, change_type);
        change.modified_property = Some(property.to_string());
        change.previous_value =
            serde_json::to_value(PropertyValue::Collections(previous.to_vec())).ok();
        change.new_value =
            serde_json::to_value(PropertyValue::Collections(current.to_vec())).ok();
        change.full_node = Some(node.clone());
        change.reasoning = Some(reason.to_string());
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryGraphStore;
    use crate::models::InheritanceEntry;
    use crate::services::changelog::MemoryChangeLog;

    async fn seed(store: &MemoryGraphStore, ids: &[&str]) {
        for id in ids {
            store
                .insert(Node::new_with_id(*id, format!("Node {id}")))
                .await;
        }
    }

    fn service(store: Arc<MemoryGraphStore>, log: Arc<MemoryChangeLog>) -> PartsService {
        PartsService::new(store, log)
    }

    #[tokio::test]
    async fn add_parts_writes_both_sides_and_logs_both_sides() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        seed(&store, &["car", "wheel"]).await;
        let svc = service(store.clone(), log.clone());

        let car = svc
            .add_parts("car", &[NodeRef::new("wheel")], "alice", "assembly", None)
            .await
            .unwrap();
        assert!(car.parts()[0].contains("wheel"));

        let wheel = store.get("wheel").await.unwrap().unwrap();
        assert!(wheel.is_part_of()[0].contains("car"));
        assert_eq!(wheel.contributors, vec!["alice"]);

        let entries = log.entries().await;
        let properties: Vec<_> = entries
            .iter()
            .filter_map(|e| e.modified_property.clone())
            .collect();
        assert!(properties.contains(&PARTS_PROPERTY.to_string()));
        assert!(
            properties.contains(&IS_PART_OF_PROPERTY.to_string()),
            "the inverse side is logged too"
        );
    }

    #[tokio::test]
    async fn duplicate_add_is_a_noop() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        seed(&store, &["car", "wheel"]).await;
        let svc = service(store.clone(), log.clone());

        svc.add_parts("car", &[NodeRef::new("wheel")], "alice", "first", None)
            .await
            .unwrap();
        let entries_before = log.len().await;
        let version_before = store.get("car").await.unwrap().unwrap().version;

        svc.add_parts("car", &[NodeRef::new("wheel")], "alice", "again", None)
            .await
            .unwrap();
        assert_eq!(log.len().await, entries_before, "nothing logged");
        assert_eq!(
            store.get("car").await.unwrap().unwrap().version,
            version_before,
            "nothing written"
        );
    }

    #[tokio::test]
    async fn parts_cycles_are_rejected() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        seed(&store, &["engine", "piston", "assembly"]).await;
        let svc = service(store.clone(), log);

        svc.add_parts("engine", &[NodeRef::new("piston")], "alice", "build", None)
            .await
            .unwrap();
        svc.add_parts("assembly", &[NodeRef::new("engine")], "alice", "build", None)
            .await
            .unwrap();

        // assembly -> engine -> piston; piston must not contain assembly.
        let err = svc
            .add_parts("piston", &[NodeRef::new("assembly")], "alice", "oops", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::CircularReference { .. }));

        let err = svc
            .add_parts("engine", &[NodeRef::new("engine")], "alice", "self", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::CircularReference { .. }));
    }

    #[tokio::test]
    async fn remove_parts_cleans_inverse_and_drops_empty_collections() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        seed(&store, &["car", "wheel"]).await;
        let svc = service(store.clone(), log);

        svc.add_parts(
            "car",
            &[NodeRef::new("wheel")],
            "alice",
            "add",
            Some("drivetrain"),
        )
        .await
        .unwrap();
        let car = store.get("car").await.unwrap().unwrap();
        assert!(find_collection(car.parts(), "drivetrain").is_some());

        let car = svc
            .remove_parts("car", &[NodeRef::new("wheel")], "alice", "strip")
            .await
            .unwrap();
        assert!(
            find_collection(car.parts(), "drivetrain").is_none(),
            "emptied non-main collection is dropped"
        );
        assert!(find_collection(car.parts(), MAIN_COLLECTION).is_some());

        let wheel = store.get("wheel").await.unwrap().unwrap();
        assert!(!contains_id(wheel.is_part_of(), "car"));
    }

    #[tokio::test]
    async fn add_is_part_of_updates_containers_and_their_subtrees() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        let mut container = Node::new_with_id("container", "Container".to_string());
        let mut spec = Node::new_with_id("spec", "Spec".to_string());
        container.specializations[0].nodes.push(NodeRef::new("spec"));
        spec.generalizations[0].nodes.push(NodeRef::new("container"));
        store.insert(container).await;
        store.insert(spec).await;
        store
            .insert(Node::new_with_id("bolt", "Bolt".to_string()))
            .await;
        let svc = service(store.clone(), log);

        svc.add_is_part_of("bolt", &[NodeRef::new("container")], "alice", "fit", None)
            .await
            .unwrap();

        let container = store.get("container").await.unwrap().unwrap();
        assert!(contains_id(container.parts(), "bolt"));
        let spec = store.get("spec").await.unwrap().unwrap();
        assert_eq!(
            spec.inheritance_parts["bolt"].inherited_from_id, "container",
            "the container's specializations inherit the new part"
        );
    }

    #[tokio::test]
    async fn collection_lifecycle_rules() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        seed(&store, &["node", "bolt"]).await;
        let svc = service(store.clone(), log);

        let err = svc
            .create_collection("node", PartsSide::Parts, "Main", "alice", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::ReservedCollection(_)));

        svc.create_collection("node", PartsSide::Parts, "fasteners", "alice", "r")
            .await
            .unwrap();
        let err = svc
            .create_collection("node", PartsSide::Parts, "fasteners", "alice", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::DuplicateCollection { .. }));

        svc.add_parts(
            "node",
            &[NodeRef::new("bolt")],
            "alice",
            "r",
            Some("fasteners"),
        )
        .await
        .unwrap();
        let err = svc
            .delete_collection("node", PartsSide::Parts, "fasteners", "alice", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::CollectionNotEmpty { .. }));

        svc.remove_parts("node", &[NodeRef::new("bolt")], "alice", "r")
            .await
            .unwrap();
        // remove_parts already dropped the emptied collection.
        let err = svc
            .delete_collection("node", PartsSide::Parts, "fasteners", "alice", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::CollectionNotFound { .. }));
    }

    #[tokio::test]
    async fn reorder_requires_a_permutation() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        seed(&store, &["node", "a", "b", "c"]).await;
        let svc = service(store.clone(), log);

        svc.add_parts(
            "node",
            &[NodeRef::new("a"), NodeRef::new("b"), NodeRef::new("c")],
            "alice",
            "r",
            None,
        )
        .await
        .unwrap();

        let node = svc
            .reorder(
                "node",
                PartsSide::Parts,
                MAIN_COLLECTION,
                &["c".to_string(), "a".to_string(), "b".to_string()],
                "alice",
                "priority",
            )
            .await
            .unwrap();
        let order: Vec<_> = node.parts()[0].nodes.iter().map(|r| r.id.clone()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);

        let err = svc
            .reorder(
                "node",
                PartsSide::Parts,
                MAIN_COLLECTION,
                &["c".to_string(), "a".to_string()],
                "alice",
                "broken",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::Validation(_)));
    }

    #[tokio::test]
    async fn rejected_add_parts_leaves_explicit_mode_intact() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        let mut template = Node::new_with_id("template", "Template".to_string());
        template.parts_mut()[0].nodes.push(NodeRef::new("blade"));
        let mut knife = Node::new_with_id("knife", "Knife".to_string());
        template.specializations[0].nodes.push(NodeRef::new("knife"));
        knife.generalizations[0].nodes.push(NodeRef::new("template"));
        knife.inheritance.insert(
            PARTS_PROPERTY.to_string(),
            InheritanceEntry::default_from(Some("template".to_string())),
        );
        store.insert(template).await;
        store.insert(knife).await;
        store
            .insert(Node::new_with_id("blade", "Blade".to_string()))
            .await;
        let svc = service(store.clone(), log);

        let err = svc
            .add_parts("knife", &[NodeRef::new("missing")], "alice", "r", None)
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::NotFound { .. }));

        let knife = store.get("knife").await.unwrap().unwrap();
        assert_eq!(
            knife.inheritance[PARTS_PROPERTY].reference.as_deref(),
            Some("template"),
            "a rejected add must not break explicit-source mode"
        );
        assert_eq!(knife.version, 1, "nothing was written");
    }

    #[tokio::test]
    async fn sync_part_relations_restores_missing_inverse_edges() {
        let store = Arc::new(MemoryGraphStore::new());
        let log = Arc::new(MemoryChangeLog::new());
        let mut rotor = Node::new_with_id("rotor", "Rotor".to_string());
        rotor.parts_mut()[0].nodes.push(NodeRef::new("blade"));
        rotor.is_part_of_mut()[0].nodes.push(NodeRef::new("turbine"));
        store.insert(rotor).await;
        seed(&store, &["blade", "turbine"]).await;
        let svc = service(store.clone(), log.clone());

        svc.sync_part_relations("rotor").await.unwrap();

        let blade = store.get("blade").await.unwrap().unwrap();
        assert!(contains_id(blade.is_part_of(), "rotor"));
        let turbine = store.get("turbine").await.unwrap().unwrap();
        assert!(contains_id(turbine.parts(), "rotor"));
        assert_eq!(log.len().await, 0, "repairs are not change-logged");
    }
}
