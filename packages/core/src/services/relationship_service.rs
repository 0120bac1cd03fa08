//! Specialization / Generalization Manager
//!
//! Maintains the is-a hierarchy: the `specializations` and `generalizations`
//! sides of every node, organized into named collections. Both endpoints of
//! an edge are written in one transaction; the hierarchy is kept acyclic and
//! every node except the roots keeps at least one generalization.
//!
//! Edge mutations kick off the inheritance cascades after their own commit:
//! property inheritance ([`InheritanceService`]) and the derived parts cache
//! ([`PartsInheritanceService`]). Cascade failures are logged, never returned;
//! a later regeneration repairs the subtree idempotently.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::error;

use crate::db::{GraphStore, Txn};
use crate::models::{
    ensure_collection, find_collection, find_collection_mut, flatten_ids, ChangeType, Collection,
    Node, NodeChange, NodeRef, MAIN_COLLECTION,
};

use super::changelog::{ChangeLog, ChangeRecorder};
use super::error::OntologyError;
use super::inheritance_service::InheritanceService;
use super::parts_inheritance::PartsInheritanceService;
use super::{require_non_blank, with_retry};

/// Which side of the is-a relation an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    Specializations,
    Generalizations,
}

impl RelationKind {
    pub fn property(self) -> &'static str {
        match self {
            RelationKind::Specializations => "specializations",
            RelationKind::Generalizations => "generalizations",
        }
    }

    pub fn inverse(self) -> RelationKind {
        match self {
            RelationKind::Specializations => RelationKind::Generalizations,
            RelationKind::Generalizations => RelationKind::Specializations,
        }
    }
}

pub struct RelationshipService {
    store: Arc<dyn GraphStore>,
    changelog: ChangeRecorder,
    inheritance: InheritanceService,
    parts_inheritance: PartsInheritanceService,
}

impl RelationshipService {
    pub fn new(store: Arc<dyn GraphStore>, changelog: Arc<dyn ChangeLog>) -> Self {
        let recorder = ChangeRecorder::new(changelog);
        Self {
            store: store.clone(),
            changelog: recorder.clone(),
            inheritance: InheritanceService::new(store.clone(), recorder.clone()),
            parts_inheritance: PartsInheritanceService::new(store, recorder),
        }
    }

    // --- Edge mutations ---------------------------------------------------

    /// Add specializations (children) to a node. The inverse edge lands in
    /// each child's `"main"` generalizations collection; refs already present
    /// on the side are skipped, and an all-duplicate request is a no-op.
    pub async fn add_specializations(
        &self,
        node_id: &str,
        nodes: &[NodeRef],
        actor: &str,
        reason: &str,
        collection_name: Option<&str>,
    ) -> Result<Node, OntologyError> {
        self.add_related(node_id, nodes, RelationKind::Specializations, actor, reason, collection_name)
            .await
    }

    /// Add generalizations (parents) to a node. The inverse edge lands in
    /// each parent's `"main"` specializations collection.
    pub async fn add_generalizations(
        &self,
        node_id: &str,
        nodes: &[NodeRef],
        actor: &str,
        reason: &str,
        collection_name: Option<&str>,
    ) -> Result<Node, OntologyError> {
        self.add_related(node_id, nodes, RelationKind::Generalizations, actor, reason, collection_name)
            .await
    }

    /// Remove specializations from a node, cleaning the inverse edge on each
    /// child. Rejected if any child would be left without a generalization.
    pub async fn remove_specializations(
        &self,
        node_id: &str,
        nodes: &[NodeRef],
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        self.remove_related(node_id, nodes, RelationKind::Specializations, actor, reason)
            .await
    }

    /// Remove generalizations from a node. Rejected if the node would be
    /// left without any generalization.
    pub async fn remove_generalizations(
        &self,
        node_id: &str,
        nodes: &[NodeRef],
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        self.remove_related(node_id, nodes, RelationKind::Generalizations, actor, reason)
            .await
    }

    async fn add_related(
        &self,
        node_id: &str,
        refs: &[NodeRef],
        kind: RelationKind,
        actor: &str,
        reason: &str,
        collection_name: Option<&str>,
    ) -> Result<Node, OntologyError> {
        self.validate_edge_input(node_id, refs, actor)?;
        let collection_name = collection_name.unwrap_or(MAIN_COLLECTION);

        let (node, added) = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous = self.side_ref(&node, kind).to_vec();

            let mut related_nodes: Vec<Node> = Vec::new();
            for related_ref in refs {
                let related = self.read_active(&txn, &related_ref.id).await?;
                let (child_id, parent_id) = self.edge_endpoints(node_id, &related.id, kind);
                if self.would_create_is_a_cycle(&txn, child_id, parent_id).await? {
                    return Err(OntologyError::circular_reference(format!(
                        "making {child_id} a specialization of {parent_id} closes an is-a cycle"
                    )));
                }
                related_nodes.push(related);
            }

            let side = self.side_mut(&mut node, kind);
            let existing: HashSet<String> = flatten_ids(side).into_iter().collect();
            let added: Vec<String> = refs
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

            for mut related in related_nodes {
                if !added.contains(&related.id) {
                    continue;
                }
                let inverse = self.side_mut(&mut related, kind.inverse());
                if !crate::models::contains_id(inverse, node_id) {
                    ensure_collection(inverse, MAIN_COLLECTION)
                        .nodes
                        .push(NodeRef::new(node_id));
                    related.add_contributor(actor);
                    related.touch();
                    txn.stage(related);
                }
            }

            txn.commit().await?;

            self.changelog
                .record(self.relation_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::AddElement,
                    kind,
                    &previous,
                ))
                .await;

            Ok((node, added))
        })
        .await?;

        for related_id in &added {
            let (child_id, parent_id) = self.edge_endpoints(node_id, related_id, kind);
            if let Err(err) = self
                .inheritance
                .update_after_adding_generalization(child_id, parent_id)
                .await
            {
                error!(child_id, parent_id, %err, "inheritance cascade failed after adding edge");
            }
            if let Err(err) = self
                .parts_inheritance
                .handle_generalization_change(child_id)
                .await
            {
                error!(child_id, %err, "parts inheritance cascade failed after adding edge");
            }
        }
        Ok(node)
    }

    async fn remove_related(
        &self,
        node_id: &str,
        refs: &[NodeRef],
        kind: RelationKind,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        self.validate_edge_input(node_id, refs, actor)?;

        let (node, removed) = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous = self.side_ref(&node, kind).to_vec();

            if kind == RelationKind::Generalizations {
                self.validate_generalization_removal(&node, refs)?;
            }

            let side = self.side_mut(&mut node, kind);
            let mut removed: Vec<String> = Vec::new();
            for related_ref in refs {
                if crate::models::remove_id(side, &related_ref.id) {
                    removed.push(related_ref.id.clone());
                }
            }
            if removed.is_empty() {
                return Ok((node, Vec::new()));
            }
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());

            for id in &removed {
                // Stale references to missing nodes are skipped silently.
                let Some(mut related) = txn.get(id).await? else {
                    continue;
                };
                if kind == RelationKind::Specializations {
                    self.validate_generalization_removal(
                        &related,
                        &[NodeRef::new(node_id)],
                    )?;
                }
                if crate::models::remove_id(self.side_mut(&mut related, kind.inverse()), node_id) {
                    related.add_contributor(actor);
                    related.touch();
                    txn.stage(related);
                }
            }

            txn.commit().await?;

            self.changelog
                .record(self.relation_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::RemoveElement,
                    kind,
                    &previous,
                ))
                .await;

            Ok((node, removed))
        })
        .await?;

        for related_id in &removed {
            let (child_id, parent_id) = self.edge_endpoints(node_id, related_id, kind);
            if let Err(err) = self
                .inheritance
                .update_after_removing_generalization(child_id, parent_id)
                .await
            {
                error!(child_id, parent_id, %err, "inheritance cascade failed after removing edge");
            }
            if let Err(err) = self
                .parts_inheritance
                .handle_generalization_change(child_id)
                .await
            {
                error!(child_id, %err, "parts inheritance cascade failed after removing edge");
            }
        }
        Ok(node)
    }

    // --- Collection management --------------------------------------------

    /// Create an empty named collection on one side of the is-a relation.
    pub async fn create_collection(
        &self,
        node_id: &str,
        kind: RelationKind,
        collection_name: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        self.create_collections(node_id, kind, &[collection_name.to_string()], actor, reason)
            .await
    }

    /// Create several empty named collections at once. The whole request is
    /// rejected if any name is reserved, blank, or already present.
    pub async fn create_collections(
        &self,
        node_id: &str,
        kind: RelationKind,
        collection_names: &[String],
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(actor, "actor")?;
        if collection_names.is_empty() {
            return Err(OntologyError::validation(
                "at least one collection name must be provided",
            ));
        }
        for name in collection_names {
            require_non_blank(name, "collection name")?;
            if name.eq_ignore_ascii_case(MAIN_COLLECTION) {
                return Err(OntologyError::ReservedCollection(name.clone()));
            }
        }

        with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous = self.side_ref(&node, kind).to_vec();

            let collections = self.side_mut(&mut node, kind);
            for name in collection_names {
                if find_collection(collections, name).is_some() {
                    return Err(OntologyError::duplicate_collection(name, kind.property()));
                }
            }
            for name in collection_names {
                collections.push(Collection::named(name));
            }
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            self.changelog
                .record(self.relation_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::AddCollection,
                    kind,
                    &previous,
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
        kind: RelationKind,
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
            let previous = self.side_ref(&node, kind).to_vec();

            let collections = self.side_mut(&mut node, kind);
            let index = collections
                .iter()
                .position(|c| c.collection_name == collection_name)
                .ok_or_else(|| {
                    OntologyError::collection_not_found(collection_name, kind.property())
                })?;
            let count = collections[index].nodes.len();
            if count > 0 {
                return Err(OntologyError::CollectionNotEmpty {
                    name: collection_name.to_string(),
                    count,
                });
            }
            collections.remove(index);
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            self.changelog
                .record(self.relation_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::DeleteCollection,
                    kind,
                    &previous,
                ))
                .await;
            Ok(node)
        })
        .await
    }

    /// Rename a named collection. `"main"` can be neither renamed nor used
    /// as the new name; renaming onto an existing name is rejected.
    pub async fn rename_collection(
        &self,
        node_id: &str,
        kind: RelationKind,
        old_name: &str,
        new_name: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(old_name, "collection name")?;
        require_non_blank(new_name, "collection name")?;
        require_non_blank(actor, "actor")?;
        if old_name.eq_ignore_ascii_case(MAIN_COLLECTION)
            || new_name.eq_ignore_ascii_case(MAIN_COLLECTION)
        {
            return Err(OntologyError::ReservedCollection(MAIN_COLLECTION.to_string()));
        }
        if old_name == new_name {
            return Err(OntologyError::validation(
                "new collection name must differ from the old name",
            ));
        }

        with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous = self.side_ref(&node, kind).to_vec();

            let collections = self.side_mut(&mut node, kind);
            if find_collection(collections, new_name).is_some() {
                return Err(OntologyError::duplicate_collection(new_name, kind.property()));
            }
            let collection = find_collection_mut(collections, old_name)
                .ok_or_else(|| OntologyError::collection_not_found(old_name, kind.property()))?;
            collection.collection_name = new_name.to_string();
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            self.changelog
                .record(self.relation_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::EditCollection,
                    kind,
                    &previous,
                ))
                .await;
            Ok(node)
        })
        .await
    }

    /// Move references between two named collections on the same side.
    /// Both collections must exist and every moved ref must be in the
    /// source; emptied collections are preserved by moves.
    pub async fn move_between_collections(
        &self,
        node_id: &str,
        kind: RelationKind,
        nodes: &[NodeRef],
        source: &str,
        target: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        self.validate_edge_input(node_id, nodes, actor)?;

        with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = self.read_active(&txn, node_id).await?;
            let previous = self.side_ref(&node, kind).to_vec();

            let collections = self.side_mut(&mut node, kind);
            if find_collection(collections, target).is_none() {
                return Err(OntologyError::collection_not_found(target, kind.property()));
            }
            {
                let source_collection = find_collection_mut(collections, source)
                    .ok_or_else(|| OntologyError::collection_not_found(source, kind.property()))?;
                for moved in nodes {
                    if !source_collection.contains(&moved.id) {
                        return Err(OntologyError::validation(format!(
                            "node {} is not in collection '{}'",
                            moved.id, source
                        )));
                    }
                }
                source_collection
                    .nodes
                    .retain(|r| !nodes.iter().any(|m| m.id == r.id));
            }
            let target_collection = find_collection_mut(collections, target)
                .ok_or_else(|| OntologyError::collection_not_found(target, kind.property()))?;
            for moved in nodes {
                if !target_collection.contains(&moved.id) {
                    target_collection.nodes.push(NodeRef::new(&moved.id));
                }
            }
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            self.changelog
                .record(self.relation_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::SortElements,
                    kind,
                    &previous,
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
        kind: RelationKind,
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
            let previous = self.side_ref(&node, kind).to_vec();

            let collections = self.side_mut(&mut node, kind);
            let collection =
                find_collection_mut(collections, collection_name).ok_or_else(|| {
                    OntologyError::collection_not_found(collection_name, kind.property())
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
                .record(self.relation_change(
                    &node,
                    actor,
                    reason,
                    ChangeType::SortElements,
                    kind,
                    &previous,
                ))
                .await;
            Ok(node)
        })
        .await
    }

    // --- Helpers ----------------------------------------------------------

    /// The (child, parent) pair of an edge touched through `node_id`'s side
    /// of the relation.
    fn edge_endpoints<'b>(
        &self,
        node_id: &'b str,
        related_id: &'b str,
        kind: RelationKind,
    ) -> (&'b str, &'b str) {
        match kind {
            RelationKind::Specializations => (related_id, node_id),
            RelationKind::Generalizations => (node_id, related_id),
        }
    }

    /// True if making `child_id` a specialization of `parent_id` closes a
    /// cycle: the child must not already be an ancestor of the parent.
    /// Self-loops count as cycles.
    async fn would_create_is_a_cycle(
        &self,
        txn: &Txn<'_>,
        child_id: &str,
        parent_id: &str,
    ) -> Result<bool, OntologyError> {
        if child_id == parent_id {
            return Ok(true);
        }
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = vec![parent_id.to_string()];
        while let Some(current) = stack.pop() {
            if current == child_id {
                return Ok(true);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(node) = txn.get(&current).await? else {
                continue;
            };
            for ancestor in flatten_ids(&node.generalizations) {
                stack.push(ancestor);
            }
        }
        Ok(false)
    }

    /// Every node keeps at least one generalization; only roots (nodes that
    /// already have none) are exempt.
    fn validate_generalization_removal(
        &self,
        node: &Node,
        to_remove: &[NodeRef],
    ) -> Result<(), OntologyError> {
        let all = flatten_ids(&node.generalizations);
        if all.is_empty() {
            return Ok(());
        }
        let remaining = all
            .iter()
            .filter(|id| !to_remove.iter().any(|r| &r.id == *id))
            .count();
        if remaining == 0 {
            return Err(OntologyError::LastGeneralization {
                id: node.id.clone(),
            });
        }
        Ok(())
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

    fn side_mut<'b>(&self, node: &'b mut Node, kind: RelationKind) -> &'b mut Vec<Collection> {
        match kind {
            RelationKind::Specializations => &mut node.specializations,
            RelationKind::Generalizations => &mut node.generalizations,
        }
    }

    fn side_ref<'b>(&self, node: &'b Node, kind: RelationKind) -> &'b [Collection] {
        match kind {
            RelationKind::Specializations => &node.specializations,
            RelationKind::Generalizations => &node.generalizations,
        }
    }

    fn relation_change(
        &self,
        node: &Node,
        actor: &str,
        reason: &str,
        change_type: ChangeType,
        kind: RelationKind,
        previous: &[Collection],
    ) -> NodeChange {
        let mut change = NodeChange::new(&node.id, actor, change_type);
        change.modified_property = Some(kind.property().to_string());
        change.previous_value = serde_json::to_value(previous).ok();
        change.new_value = serde_json::to_value(self.side_ref(node, kind)).ok();
        change.full_node = Some(node.clone());
        change.reasoning = Some(reason.to_string());
        change
    }
}
