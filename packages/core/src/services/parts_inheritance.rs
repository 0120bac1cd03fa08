//! Parts Inheritance Calculator
//!
//! Maintains the derived `inheritanceParts` cache: the set of parts a node
//! sees through its generalization chain without owning them directly. Two
//! computation modes exist, selected by `inheritance.parts.ref`:
//!
//! - **explicit-source** (`ref = Some(S)`): inherit S's direct parts plus
//!   S's own inherited parts, minus anything owned directly;
//! - **union** (`ref = None`): the union over all generalizations, first
//!   provider of a part winning.
//!
//! Every entry records the ultimate origin of the part (traced through the
//! source's own cache) with a denormalized title. Recomputation is pure and
//! idempotent, which makes it the repair step after interrupted cascades.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::db::{BatchWriter, GraphStore, StoreError, Txn};
use crate::models::{
    flatten_ids, ChangeType, InheritanceEntry, InheritedPart, Node, NodeChange, PropertyValue,
    PARTS_PROPERTY,
};

use super::changelog::ChangeRecorder;
use super::error::OntologyError;
use super::{require_non_blank, with_retry};

pub struct PartsInheritanceService {
    store: Arc<dyn GraphStore>,
    changelog: ChangeRecorder,
}

type CascadeCache = HashMap<String, Node>;

impl PartsInheritanceService {
    pub fn new(store: Arc<dyn GraphStore>, changelog: ChangeRecorder) -> Self {
        Self { store, changelog }
    }

    // --- Computation ------------------------------------------------------

    /// Compute the inherited-parts set for `node`, loading whatever sources
    /// it needs through the cascade cache.
    async fn compute(
        &self,
        node: &Node,
        cache: &mut CascadeCache,
    ) -> Result<BTreeMap<String, InheritedPart>, StoreError> {
        let mut inherited: BTreeMap<String, InheritedPart> = BTreeMap::new();
        let own: HashSet<String> = flatten_ids(node.parts()).into_iter().collect();

        let explicit_source = node
            .inheritance
            .get(PARTS_PROPERTY)
            .and_then(|e| e.reference.clone());

        let sources: Vec<String> = match &explicit_source {
            Some(source_id) => vec![source_id.clone()],
            None => flatten_ids(&node.generalizations),
        };

        for source_id in sources {
            let Some(source) = self.load_cached(cache, &source_id).await? else {
                continue;
            };
            if source.deleted {
                continue;
            }

            // Direct parts of the source first, then what the source itself
            // inherited; an earlier provider always wins.
            for part_id in flatten_ids(source.parts()) {
                if own.contains(&part_id) || inherited.contains_key(&part_id) {
                    continue;
                }
                inherited.insert(
                    part_id,
                    InheritedPart {
                        inherited_from_id: source.id.clone(),
                        inherited_from_title: source.title.clone(),
                    },
                );
            }
            for (part_id, origin) in &source.inheritance_parts {
                if own.contains(part_id) || inherited.contains_key(part_id) {
                    continue;
                }
                inherited.insert(part_id.clone(), origin.clone());
            }
        }

        Ok(inherited)
    }

    /// Recompute and persist one node's `inheritanceParts`. No write when
    /// the cache is already correct. This is the idempotent repair step.
    pub async fn refresh(&self, node_id: &str) -> Result<(), OntologyError> {
        let mut cache: CascadeCache = HashMap::new();
        let Some(mut node) = self.load_cached(&mut cache, node_id).await? else {
            return Ok(());
        };
        if node.deleted {
            return Ok(());
        }
        let inherited = self.compute(&node, &mut cache).await?;
        if inherited == node.inheritance_parts {
            return Ok(());
        }
        node.inheritance_parts = inherited;
        let mut writer = BatchWriter::new(self.store.as_ref());
        writer.write(node).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Recompute `inheritanceParts` for every node in the specialization
    /// subtree of `node_id` (the node itself excluded), writing in capped
    /// batches.
    ///
    /// The subtree is processed in topological order over its specialization
    /// edges, so a node reachable along several paths (a diamond) is only
    /// recomputed after every affected ancestor has settled, never against a
    /// stale cache.
    pub async fn propagate_to_specializations(&self, node_id: &str) -> Result<(), OntologyError> {
        let mut cache: CascadeCache = HashMap::new();
        let Some(root) = self.load_cached(&mut cache, node_id).await? else {
            return Ok(());
        };

        // Discover the subtree.
        let mut members: HashSet<String> = HashSet::new();
        members.insert(root.id.clone());
        let mut queue: VecDeque<String> = flatten_ids(&root.specializations).into();
        while let Some(id) = queue.pop_front() {
            if members.contains(&id) {
                continue;
            }
            let Some(node) = self.load_cached(&mut cache, &id).await? else {
                continue;
            };
            if node.deleted {
                continue;
            }
            members.insert(id);
            for child_id in flatten_ids(&node.specializations) {
                queue.push_back(child_id);
            }
        }

        // In-degrees restricted to subtree edges; a node is ready once all
        // of its in-subtree parents have been recomputed.
        let mut indegree: HashMap<String, usize> = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for member_id in &members {
            let Some(member) = cache.get(member_id) else {
                continue;
            };
            let child_ids: Vec<String> = flatten_ids(&member.specializations)
                .into_iter()
                .filter(|id| members.contains(id) && id != member_id)
                .collect();
            for child_id in &child_ids {
                *indegree.entry(child_id.clone()).or_insert(0) += 1;
            }
            children.insert(member_id.clone(), child_ids);
        }

        let mut writer = BatchWriter::new(self.store.as_ref());
        let mut ready: VecDeque<String> = VecDeque::new();
        ready.push_back(root.id.clone());

        while let Some(current_id) = ready.pop_front() {
            if current_id != root.id {
                if let Some(mut spec) = self.load_cached(&mut cache, &current_id).await? {
                    let inherited = self.compute(&spec, &mut cache).await?;
                    if inherited != spec.inheritance_parts {
                        spec.inheritance_parts = inherited;
                        cache.insert(current_id.clone(), spec.clone());
                        writer.write(spec).await?;
                    }
                }
            }
            for child_id in children.get(&current_id).cloned().unwrap_or_default() {
                if let Some(degree) = indegree.get_mut(&child_id) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(child_id);
                    }
                }
            }
        }

        writer.flush().await?;
        debug!(node_id, writes = writer.committed(), "parts inheritance propagation finished");
        Ok(())
    }

    // --- Triggers ---------------------------------------------------------

    /// A node's generalization set changed: recompute it, then its subtree.
    pub async fn handle_generalization_change(&self, node_id: &str) -> Result<(), OntologyError> {
        self.refresh(node_id).await?;
        self.propagate_to_specializations(node_id).await
    }

    /// A node's direct parts changed: its own exclusion set moved, and
    /// every specialization may now see a different inherited set.
    pub async fn handle_parts_change(&self, node_id: &str) -> Result<(), OntologyError> {
        self.refresh(node_id).await?;
        self.propagate_to_specializations(node_id).await
    }

    /// Switch the parts-inheritance mode of a node.
    ///
    /// - `None -> Some(r)`: direct parts are reset to an empty `"main"`
    ///   collection and the inherited set is recomputed from `r`;
    /// - `Some -> None`: the currently inherited set is materialized into
    ///   `inheritanceParts` and the ref cleared, losing nothing;
    /// - `Some(a) -> Some(b)`: reset and recompute from `b`.
    ///
    /// The change is logged and then propagated to the subtree.
    pub async fn handle_parts_inheritance_change(
        &self,
        node_id: &str,
        new_reference: Option<&str>,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(actor, "actor")?;
        if let Some(reference) = new_reference {
            if reference == node_id {
                return Err(OntologyError::validation(
                    "parts inheritance ref must not point at the node itself",
                ));
            }
            let source = self
                .store
                .get(reference)
                .await?
                .ok_or_else(|| OntologyError::not_found(reference))?;
            if source.deleted {
                return Err(OntologyError::deleted(reference));
            }
            if !self.is_generalization_ancestor(node_id, reference).await? {
                return Err(OntologyError::validation(format!(
                    "parts inheritance ref {reference} is not a generalization ancestor of {node_id}"
                )));
            }
        }

        let (node, changed) = with_retry(move || async move {
            let mut cache: CascadeCache = HashMap::new();
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = txn
                .get(node_id)
                .await?
                .ok_or_else(|| OntologyError::not_found(node_id))?;
            if node.deleted {
                return Err(OntologyError::deleted(node_id));
            }

            let current = node
                .inheritance
                .get(PARTS_PROPERTY)
                .and_then(|e| e.reference.clone());

            let changed = match (&current, new_reference) {
                (None, Some(reference)) => {
                    self.enter_explicit_mode(&mut node, reference, &mut cache)
                        .await?;
                    true
                }
                (Some(_), None) => {
                    // Materialize what is currently inherited, then own it.
                    let inherited = self.compute(&node, &mut cache).await?;
                    node.inheritance_parts = inherited;
                    self.set_parts_reference(&mut node, None);
                    true
                }
                (Some(current_ref), Some(reference)) if current_ref != reference => {
                    self.enter_explicit_mode(&mut node, reference, &mut cache)
                        .await?;
                    true
                }
                _ => false,
            };

            if !changed {
                return Ok((node, false));
            }

            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            let mut change = NodeChange::new(node_id, actor, ChangeType::ModifyElements);
            change.modified_property = Some("inheritance.parts.ref".to_string());
            change.previous_value = serde_json::to_value(&current).ok();
            change.new_value = serde_json::to_value(new_reference).ok();
            change.full_node = Some(node.clone());
            change.reasoning = Some(reason.to_string());
            self.changelog.record(change).await;

            Ok((node, true))
        })
        .await?;

        if changed {
            if let Err(error) = self.propagate_to_specializations(node_id).await {
                tracing::error!(node_id, %error, "parts inheritance propagation failed");
            }
        }

        Ok(node)
    }

    /// Direct parts are being added while the node is in explicit-source
    /// mode: break the mode first by materializing the inherited set, so no
    /// inherited membership is silently lost.
    ///
    /// Mutates the node in place so the caller can stage it inside its own
    /// transaction; a rejected add must not leave the mode break behind.
    /// Returns the previous ref when the mode was broken, for the caller's
    /// change-log entry.
    pub async fn handle_add_parts_with_inheritance_ref(
        &self,
        node: &mut Node,
    ) -> Result<Option<String>, StoreError> {
        let current = node
            .inheritance
            .get(PARTS_PROPERTY)
            .and_then(|e| e.reference.clone());
        let Some(current_ref) = current else {
            return Ok(None);
        };

        let mut cache: CascadeCache = HashMap::new();
        let inherited = self.compute(node, &mut cache).await?;
        node.inheritance_parts = inherited;
        self.set_parts_reference(node, None);
        Ok(Some(current_ref))
    }

    // --- Helpers ----------------------------------------------------------

    /// True if `candidate` is reachable from `node_id` by ascending
    /// generalization edges. An explicit parts source must be an ancestor.
    async fn is_generalization_ancestor(
        &self,
        node_id: &str,
        candidate: &str,
    ) -> Result<bool, OntologyError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = vec![node_id.to_string()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(node) = self.store.get(&current).await? else {
                continue;
            };
            for parent_id in flatten_ids(&node.generalizations) {
                if parent_id == candidate {
                    return Ok(true);
                }
                stack.push(parent_id);
            }
        }
        Ok(false)
    }

    async fn enter_explicit_mode(
        &self,
        node: &mut Node,
        reference: &str,
        cache: &mut CascadeCache,
    ) -> Result<(), StoreError> {
        self.set_parts_reference(node, Some(reference.to_string()));
        node.properties.insert(
            PARTS_PROPERTY.to_string(),
            PropertyValue::empty_collections(),
        );
        let inherited = self.compute(node, cache).await?;
        node.inheritance_parts = inherited;
        Ok(())
    }

    fn set_parts_reference(&self, node: &mut Node, reference: Option<String>) {
        node.inheritance
            .entry(PARTS_PROPERTY.to_string())
            .or_insert_with(|| InheritanceEntry::default_from(None))
            .reference = reference;
    }

    async fn load_cached(
        &self,
        cache: &mut CascadeCache,
        id: &str,
    ) -> Result<Option<Node>, StoreError> {
        if let Some(node) = cache.get(id) {
            return Ok(Some(node.clone()));
        }
        let node = self.store.get(id).await?;
        if let Some(node) = &node {
            cache.insert(id.to_string(), node.clone());
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryGraphStore;
    use crate::models::NodeRef;
    use crate::services::changelog::MemoryChangeLog;

    fn service(store: Arc<MemoryGraphStore>) -> PartsInheritanceService {
        PartsInheritanceService::new(store, ChangeRecorder::new(Arc::new(MemoryChangeLog::new())))
    }

    fn link(parent: &mut Node, child: &mut Node) {
        parent.specializations[0].nodes.push(NodeRef::new(&child.id));
        child.generalizations[0].nodes.push(NodeRef::new(&parent.id));
    }

    fn add_part(node: &mut Node, part_id: &str) {
        node.parts_mut()[0].nodes.push(NodeRef::new(part_id));
    }

    #[tokio::test]
    async fn union_mode_first_provider_wins_and_owned_parts_are_excluded() {
        let store = Arc::new(MemoryGraphStore::new());
        let mut gen_a = Node::new_with_id("gen-a", "Gen A".to_string());
        let mut gen_b = Node::new_with_id("gen-b", "Gen B".to_string());
        let mut node = Node::new_with_id("node", "Node".to_string());

        add_part(&mut gen_a, "wheel");
        add_part(&mut gen_a, "frame");
        add_part(&mut gen_b, "wheel");
        add_part(&mut gen_b, "seat");
        add_part(&mut node, "frame"); // owned directly, never inherited

        link(&mut gen_a, &mut node);
        link(&mut gen_b, &mut node);

        store.insert(gen_a).await;
        store.insert(gen_b).await;
        store.insert(node).await;

        let svc = service(store.clone());
        svc.refresh("node").await.unwrap();

        let node = store.get("node").await.unwrap().unwrap();
        assert_eq!(
            node.inheritance_parts["wheel"].inherited_from_id, "gen-a",
            "first generalization providing the part wins"
        );
        assert_eq!(node.inheritance_parts["seat"].inherited_from_id, "gen-b");
        assert!(!node.inheritance_parts.contains_key("frame"));
    }

    #[tokio::test]
    async fn explicit_mode_traces_ultimate_origin() {
        let store = Arc::new(MemoryGraphStore::new());
        let mut origin = Node::new_with_id("origin", "Origin".to_string());
        let mut source = Node::new_with_id("source", "Source".to_string());
        let mut node = Node::new_with_id("node", "Node".to_string());

        add_part(&mut origin, "bolt");
        add_part(&mut source, "panel");
        source.inheritance_parts.insert(
            "bolt".to_string(),
            InheritedPart {
                inherited_from_id: "origin".to_string(),
                inherited_from_title: "Origin".to_string(),
            },
        );
        node.inheritance.insert(
            PARTS_PROPERTY.to_string(),
            InheritanceEntry::default_from(Some("source".to_string())),
        );

        store.insert(origin).await;
        store.insert(source).await;
        store.insert(node).await;

        let svc = service(store.clone());
        svc.refresh("node").await.unwrap();

        let node = store.get("node").await.unwrap().unwrap();
        assert_eq!(node.inheritance_parts["panel"].inherited_from_id, "source");
        assert_eq!(
            node.inheritance_parts["bolt"].inherited_from_id, "origin",
            "origin traced through the source's own cache"
        );
    }

    #[tokio::test]
    async fn leaving_explicit_mode_materializes_the_inherited_set() {
        let store = Arc::new(MemoryGraphStore::new());
        let mut source = Node::new_with_id("source", "Source".to_string());
        let mut node = Node::new_with_id("node", "Node".to_string());
        add_part(&mut source, "gear");
        node.inheritance.insert(
            PARTS_PROPERTY.to_string(),
            InheritanceEntry::default_from(Some("source".to_string())),
        );

        store.insert(source).await;
        store.insert(node).await;
        let svc = service(store.clone());

        svc.handle_parts_inheritance_change("node", None, "alice", "detach")
            .await
            .unwrap();

        let node = store.get("node").await.unwrap().unwrap();
        assert_eq!(
            node.inheritance[PARTS_PROPERTY].reference, None,
            "explicit mode left"
        );
        assert_eq!(node.inheritance_parts["gear"].inherited_from_id, "source");
    }

    #[tokio::test]
    async fn entering_explicit_mode_resets_direct_parts() {
        let store = Arc::new(MemoryGraphStore::new());
        let mut source = Node::new_with_id("source", "Source".to_string());
        let mut node = Node::new_with_id("node", "Node".to_string());
        add_part(&mut source, "gear");
        add_part(&mut node, "legacy");
        link(&mut source, &mut node);

        store.insert(source).await;
        store.insert(node).await;
        let svc = service(store.clone());

        svc.handle_parts_inheritance_change("node", Some("source"), "alice", "attach")
            .await
            .unwrap();

        let node = store.get("node").await.unwrap().unwrap();
        assert!(node.parts()[0].nodes.is_empty(), "direct parts reset");
        assert_eq!(
            node.inheritance[PARTS_PROPERTY].reference.as_deref(),
            Some("source")
        );
        assert_eq!(node.inheritance_parts["gear"].inherited_from_id, "source");
    }

    #[tokio::test]
    async fn explicit_ref_must_be_a_live_generalization_ancestor() {
        let store = Arc::new(MemoryGraphStore::new());
        let mut grand = Node::new_with_id("grand", "Grand".to_string());
        let mut parent = Node::new_with_id("parent", "Parent".to_string());
        let mut node = Node::new_with_id("node", "Node".to_string());
        let mut dead = Node::new_with_id("dead", "Dead".to_string());
        dead.deleted = true;
        link(&mut grand, &mut parent);
        link(&mut parent, &mut node);
        link(&mut dead, &mut node);

        store.insert(grand).await;
        store.insert(parent).await;
        store.insert(node).await;
        store.insert(dead).await;
        store
            .insert(Node::new_with_id("stranger", "Stranger".to_string()))
            .await;
        let svc = service(store.clone());

        let err = svc
            .handle_parts_inheritance_change("node", Some("stranger"), "alice", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::Validation(_)));

        let err = svc
            .handle_parts_inheritance_change("node", Some("dead"), "alice", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, OntologyError::Deleted { .. }));

        // A transitive ancestor is accepted.
        let node = svc
            .handle_parts_inheritance_change("node", Some("grand"), "alice", "r")
            .await
            .unwrap();
        assert_eq!(
            node.inheritance[PARTS_PROPERTY].reference.as_deref(),
            Some("grand")
        );
    }

    #[tokio::test]
    async fn propagation_reaches_the_whole_subtree() {
        let store = Arc::new(MemoryGraphStore::new());
        let mut root = Node::new_with_id("root", "Root".to_string());
        let mut mid = Node::new_with_id("mid", "Mid".to_string());
        let mut leaf = Node::new_with_id("leaf", "Leaf".to_string());
        add_part(&mut root, "axle");
        link(&mut root, &mut mid);
        link(&mut mid, &mut leaf);

        store.insert(root).await;
        store.insert(mid).await;
        store.insert(leaf).await;
        let svc = service(store.clone());

        svc.handle_parts_change("root").await.unwrap();

        let mid = store.get("mid").await.unwrap().unwrap();
        assert_eq!(mid.inheritance_parts["axle"].inherited_from_id, "root");
        let leaf = store.get("leaf").await.unwrap().unwrap();
        assert_eq!(
            leaf.inheritance_parts["axle"].inherited_from_id, "root",
            "origin stays the ultimate source at every depth"
        );
    }
}
