//! Inheritance Propagation Engine
//!
//! Owns the per-property inheritance map: generating it for a node from its
//! first generalization, applying the four inheritance rules when computing
//! property values, changing rules on demand, and cascading the consequences
//! of generalization-set changes down the specialization tree.
//!
//! # Cascade shape
//!
//! Cascades run after the initiating transaction has committed. They are
//! breadth-first walks over the specialization tree with an explicit visited
//! set, writing through a [`BatchWriter`] so no commit exceeds the store's
//! batch ceiling. A crash partway leaves already-committed batches in place;
//! `regenerate_inheritance` recomputes any node from scratch, so repair is
//! idempotent.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::db::{BatchWriter, GraphStore, StoreError, Txn};
use crate::models::{
    flatten_ids, ChangeType, InheritanceEntry, InheritanceType, Node, NodeChange, PropertyValue,
    IS_PART_OF_PROPERTY, PARTS_PROPERTY,
};

use super::changelog::ChangeRecorder;
use super::error::OntologyError;
use super::{require_non_blank, with_retry};

pub struct InheritanceService {
    store: Arc<dyn GraphStore>,
    changelog: ChangeRecorder,
}

/// Nodes touched by a running cascade. Reads go through the cache so a node
/// staged in a pending batch is seen in its post-patch state.
type CascadeCache = HashMap<String, Node>;

impl InheritanceService {
    pub fn new(store: Arc<dyn GraphStore>, changelog: ChangeRecorder) -> Self {
        Self { store, changelog }
    }

    // --- Generation -------------------------------------------------------

    /// Build the inheritance map a specialization of `parent` starts with.
    ///
    /// Entries are copied from the parent; any entry whose ref is null (the
    /// parent owns that value locally) is pointed at the parent, so the ref
    /// always names the node the value ultimately comes from. `isPartOf` is
    /// never inherited and keeps a null ref.
    pub fn generate_inheritance(parent: &Node) -> BTreeMap<String, InheritanceEntry> {
        let mut inheritance = parent.inheritance.clone();

        // Parent properties without an entry get the default rule.
        for property in parent.properties.keys() {
            inheritance
                .entry(property.clone())
                .or_insert_with(|| InheritanceEntry::default_from(None));
        }

        for (property, entry) in inheritance.iter_mut() {
            if entry.reference.is_none() && property != IS_PART_OF_PROPERTY {
                entry.reference = Some(parent.id.clone());
            }
        }
        inheritance
    }

    /// Merge parent properties into a child's property set according to the
    /// inheritance rules.
    ///
    /// Collection-valued properties that must not be inherited come out as a
    /// single empty `"main"` collection rather than a copy of the parent's
    /// references. Child-only properties are preserved; `parts` and
    /// `isPartOf` are always present in the result.
    pub fn inherit_properties(
        parent: &Node,
        child_properties: &BTreeMap<String, PropertyValue>,
        inheritance: &BTreeMap<String, InheritanceEntry>,
    ) -> BTreeMap<String, PropertyValue> {
        let mut merged: BTreeMap<String, PropertyValue> = BTreeMap::new();
        merged.insert(
            PARTS_PROPERTY.to_string(),
            PropertyValue::empty_collections(),
        );
        merged.insert(
            IS_PART_OF_PROPERTY.to_string(),
            PropertyValue::empty_collections(),
        );

        for (key, parent_value) in &parent.properties {
            if key == PARTS_PROPERTY || key == IS_PART_OF_PROPERTY {
                continue;
            }
            let rule = inheritance
                .get(key)
                .map(|e| e.inheritance_type)
                .unwrap_or(InheritanceType::InheritUnlessAlreadyOverRidden);
            let child_value = child_properties.get(key);
            let is_collection = parent_value.is_collections();

            let value = match rule {
                InheritanceType::NeverInherit | InheritanceType::InheritAfterReview => {
                    if is_collection {
                        PropertyValue::empty_collections()
                    } else {
                        match child_value {
                            Some(v) => v.clone(),
                            None => continue,
                        }
                    }
                }
                InheritanceType::AlwaysInherit => parent_value.clone(),
                InheritanceType::InheritUnlessAlreadyOverRidden => match child_value {
                    Some(v) => {
                        if is_collection && !v.is_collections() {
                            PropertyValue::empty_collections()
                        } else {
                            v.clone()
                        }
                    }
                    None => parent_value.clone(),
                },
            };
            merged.insert(key.clone(), value);
        }

        // Child-only properties survive the merge untouched.
        for (key, value) in child_properties {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }

        merged
    }

    // --- Rule management --------------------------------------------------

    /// Change the inheritance rule for one or more properties of a node.
    ///
    /// No-op rule changes are skipped; if nothing remains the node is
    /// returned unchanged without a write or a change-log entry. After the
    /// commit the new rules are applied down the specialization tree for
    /// every descendant whose ref still points at this node.
    pub async fn update_inheritance(
        &self,
        node_id: &str,
        rules: &BTreeMap<String, InheritanceType>,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(actor, "actor")?;
        if rules.is_empty() {
            return Err(OntologyError::validation(
                "at least one property inheritance rule must be specified",
            ));
        }

        let (node, changed) = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = txn
                .get(node_id)
                .await?
                .ok_or_else(|| OntologyError::not_found(node_id))?;
            if node.deleted {
                return Err(OntologyError::deleted(node_id));
            }

            for property in rules.keys() {
                if !node.properties.contains_key(property) {
                    return Err(OntologyError::validation(format!(
                        "property \"{property}\" not found in node"
                    )));
                }
            }

            let previous = node.inheritance.clone();
            let mut changed: Vec<String> = Vec::new();
            for (property, &rule) in rules {
                match node.inheritance.get_mut(property) {
                    Some(entry) => {
                        if entry.inheritance_type == rule {
                            continue;
                        }
                        entry.inheritance_type = rule;
                    }
                    None => {
                        node.inheritance
                            .insert(property.clone(), InheritanceEntry::new(None, rule));
                    }
                }
                changed.push(property.clone());
            }

            if changed.is_empty() {
                return Ok((node, changed));
            }

            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            let mut change = NodeChange::new(node_id, actor, ChangeType::ModifyElements);
            change.modified_property = Some("inheritance".to_string());
            change.previous_value = serde_json::to_value(&previous).ok();
            change.new_value = serde_json::to_value(&node.inheritance).ok();
            change.full_node = Some(node.clone());
            change.reasoning = Some(reason.to_string());
            change.details = serde_json::to_value(&changed).ok().map(|props| {
                serde_json::json!({ "changedProperties": props })
            });
            self.changelog.record(change).await;

            Ok((node, changed))
        })
        .await?;

        if !changed.is_empty() {
            if let Err(error) = self.propagate_property_values(&node, &changed).await {
                tracing::error!(node_id, %error, "inheritance rule cascade failed");
            }
        }

        Ok(node)
    }

    /// Rebuild a node's inheritance map and property set from its first
    /// generalization, then cascade whatever changed. Running it twice in a
    /// row is a no-op the second time.
    pub async fn regenerate_inheritance(
        &self,
        node_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Node, OntologyError> {
        require_non_blank(node_id, "node id")?;
        require_non_blank(actor, "actor")?;

        let (node, affected) = with_retry(move || async move {
            let mut txn = Txn::new(self.store.as_ref());
            let mut node = txn
                .get(node_id)
                .await?
                .ok_or_else(|| OntologyError::not_found(node_id))?;
            if node.deleted {
                return Err(OntologyError::deleted(node_id));
            }

            let generalization_ids = flatten_ids(&node.generalizations);
            let parent_id = generalization_ids.first().ok_or_else(|| {
                OntologyError::validation(
                    "node must have at least one generalization to regenerate inheritance",
                )
            })?;
            let parent = txn
                .get(parent_id)
                .await?
                .ok_or_else(|| OntologyError::not_found(parent_id))?;

            let previous_inheritance = node.inheritance.clone();
            let mut new_inheritance = Self::generate_inheritance(&parent);

            // Local overrides survive a regeneration: a null ref recorded on
            // the node means the value is owned here, not upstream.
            for (property, entry) in &previous_inheritance {
                if entry.reference.is_none() {
                    new_inheritance.insert(property.clone(), entry.clone());
                }
            }

            let new_properties =
                Self::inherit_properties(&parent, &node.properties, &new_inheritance);

            let affected: Vec<String> = new_properties
                .iter()
                .filter(|(key, value)| node.properties.get(*key) != Some(value))
                .map(|(key, _)| key.clone())
                .collect();

            if affected.is_empty()
                && new_inheritance == node.inheritance
                && new_properties == node.properties
            {
                return Ok((node, affected));
            }

            node.inheritance = new_inheritance;
            node.properties = new_properties;
            node.add_contributor(actor);
            node.touch();
            txn.stage(node.clone());
            txn.commit().await?;

            let mut change = NodeChange::new(node_id, actor, ChangeType::ModifyElements);
            change.modified_property = Some("inheritance".to_string());
            change.previous_value = serde_json::to_value(&previous_inheritance).ok();
            change.new_value = serde_json::to_value(&node.inheritance).ok();
            change.full_node = Some(node.clone());
            change.reasoning = Some(reason.to_string());
            change.details = serde_json::to_value(&affected).ok().map(|props| {
                serde_json::json!({ "action": "regenerateInheritance", "affectedProperties": props })
            });
            self.changelog.record(change).await;

            Ok((node, affected))
        })
        .await?;

        if !affected.is_empty() {
            if let Err(error) = self.propagate_property_values(&node, &affected).await {
                tracing::error!(node_id, %error, "regeneration cascade failed");
            }
        }

        Ok(node)
    }

    // --- Value propagation ------------------------------------------------

    /// Push changed property values of `source` into every descendant that
    /// inherits them, level by level down the ref chain.
    ///
    /// The affected subtree is processed in topological order over its
    /// specialization edges, so a node reachable along several paths (a
    /// diamond) is evaluated only after every ancestor inside the subtree
    /// has settled. A descendant picks up a value only while its own entry
    /// references a node inside the subtree and its own rule allows
    /// automatic inheritance; `inheritAfterReview` and `neverInherit`
    /// descendants are left alone.
    pub async fn propagate_property_values(
        &self,
        source: &Node,
        properties: &[String],
    ) -> Result<(), OntologyError> {
        let mut cache: CascadeCache = HashMap::new();
        cache.insert(source.id.clone(), source.clone());

        // Discover the specialization subtree.
        let mut members: HashSet<String> = HashSet::new();
        members.insert(source.id.clone());
        let mut queue: VecDeque<String> = flatten_ids(&source.specializations).into();
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
        // of its in-subtree parents have been processed.
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
        ready.push_back(source.id.clone());

        while let Some(current_id) = ready.pop_front() {
            if current_id != source.id {
                if let Some(mut spec) = self.load_cached(&mut cache, &current_id).await? {
                    let mut updated = false;
                    for property in properties {
                        let Some(entry) = spec.inheritance.get(property).cloned() else {
                            continue;
                        };
                        let Some(reference) = entry.reference else {
                            continue;
                        };
                        if !members.contains(&reference) {
                            continue;
                        }
                        let Some(parent_value) = cache
                            .get(&reference)
                            .and_then(|parent| parent.properties.get(property))
                            .cloned()
                        else {
                            continue;
                        };
                        match entry.inheritance_type {
                            InheritanceType::AlwaysInherit
                            | InheritanceType::InheritUnlessAlreadyOverRidden => {
                                if spec.properties.get(property) != Some(&parent_value) {
                                    spec.properties.insert(property.clone(), parent_value);
                                    updated = true;
                                }
                            }
                            InheritanceType::InheritAfterReview
                            | InheritanceType::NeverInherit => {}
                        }
                    }

                    if updated {
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
        debug!(
            source = %source.id,
            writes = writer.committed(),
            "property value propagation finished"
        );
        Ok(())
    }

    // --- Generalization-set cascades --------------------------------------

    /// After `added_id` became a generalization of `node_id`: materialize,
    /// on the node and on every descendant, the properties the new
    /// generalization defines that are neither owned locally nor already
    /// inherited through an unrelated generalization branch.
    pub async fn update_after_adding_generalization(
        &self,
        node_id: &str,
        added_id: &str,
    ) -> Result<(), OntologyError> {
        let mut cache: CascadeCache = HashMap::new();
        let Some(added) = self.load_cached(&mut cache, added_id).await? else {
            return Ok(());
        };
        if added.deleted {
            return Ok(());
        }

        let mut writer = BatchWriter::new(self.store.as_ref());
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(node_id.to_string());

        while let Some(current_id) = queue.pop_front() {
            if !visited.insert(current_id.clone()) {
                continue;
            }
            let Some(mut node) = self.load_cached(&mut cache, &current_id).await? else {
                continue;
            };
            if node.deleted {
                continue;
            }

            let generalization_ids = flatten_ids(&node.generalizations);
            let mut other_defines: HashSet<String> = HashSet::new();
            for gen_id in &generalization_ids {
                if gen_id == added_id {
                    continue;
                }
                let Some(gen) = self.load_cached(&mut cache, gen_id).await? else {
                    continue;
                };
                for (property, _) in &gen.properties {
                    // A branch that itself just inherited the property from
                    // the added generalization does not count as an
                    // independent source.
                    let via_added = gen
                        .inheritance
                        .get(property)
                        .and_then(|e| e.reference.as_deref())
                        == Some(added_id);
                    if !via_added {
                        other_defines.insert(property.clone());
                    }
                }
            }

            let mut changed = false;
            for (property, value) in &added.properties {
                if property == PARTS_PROPERTY || property == IS_PART_OF_PROPERTY {
                    continue;
                }
                if node.properties.contains_key(property) || other_defines.contains(property) {
                    continue;
                }
                node.properties.insert(property.clone(), value.clone());
                node.inheritance.insert(
                    property.clone(),
                    InheritanceEntry::default_from(Some(added_id.to_string())),
                );
                changed = true;
            }

            for child_id in flatten_ids(&node.specializations) {
                queue.push_back(child_id);
            }
            if changed {
                cache.insert(current_id.clone(), node.clone());
                writer.write(node).await?;
            }
        }

        writer.flush().await?;
        debug!(node_id, added_id, writes = writer.committed(), "generalization-add cascade finished");
        Ok(())
    }

    /// After `removed_id` stopped being a generalization of `node_id`:
    /// re-source every property that was inherited through the removed edge
    /// from the next remaining generalization that defines it, or delete it
    /// (plus its inheritance entry and text side-car) when none does. Also
    /// backfills properties the next generalization defines that the node
    /// lacks. Applied to the node and, with the same removed id, to every
    /// descendant.
    pub async fn update_after_removing_generalization(
        &self,
        node_id: &str,
        removed_id: &str,
    ) -> Result<(), OntologyError> {
        let mut cache: CascadeCache = HashMap::new();
        let removed = self.load_cached(&mut cache, removed_id).await?;

        let mut writer = BatchWriter::new(self.store.as_ref());
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(node_id.to_string());

        while let Some(current_id) = queue.pop_front() {
            if !visited.insert(current_id.clone()) {
                continue;
            }
            let Some(mut node) = self.load_cached(&mut cache, &current_id).await? else {
                continue;
            };
            if node.deleted {
                continue;
            }

            let remaining = flatten_ids(&node.generalizations);
            let remaining: Vec<String> = remaining
                .into_iter()
                .filter(|id| id != removed_id)
                .collect();
            if remaining.is_empty() {
                continue;
            }

            let mut generalizations: Vec<Node> = Vec::new();
            for gen_id in &remaining {
                if let Some(gen) = self.load_cached(&mut cache, gen_id).await? {
                    generalizations.push(gen);
                }
            }
            let Some(next) = generalizations.first().cloned() else {
                continue;
            };

            // Classify affected properties: re-source or delete.
            let mut resourced: Vec<(String, Node)> = Vec::new();
            let mut deleted: Vec<String> = Vec::new();
            for (property, entry) in &node.inheritance {
                let Some(current_ref) = entry.reference.as_deref() else {
                    continue;
                };
                let through_removed = current_ref == removed_id
                    || removed
                        .as_ref()
                        .map(|r| {
                            r.inheritance
                                .get(property)
                                .and_then(|e| e.reference.as_deref())
                                == Some(current_ref)
                        })
                        .unwrap_or(false);
                if !through_removed {
                    continue;
                }

                match generalizations
                    .iter()
                    .find(|gen| gen.properties.contains_key(property))
                {
                    Some(source) => resourced.push((property.clone(), source.clone())),
                    None => deleted.push(property.clone()),
                }
            }

            let mut changed = false;
            for (property, source) in resourced {
                if !Self::rule_allows_auto_update(&node, &property) {
                    continue;
                }
                if let Some(entry) = node.inheritance.get_mut(&property) {
                    entry.reference = Some(source.id.clone());
                }
                if let Some(value) = source.properties.get(&property) {
                    node.properties.insert(property.clone(), value.clone());
                }
                changed = true;
            }
            for property in deleted {
                if !Self::rule_allows_auto_update(&node, &property) {
                    continue;
                }
                node.properties.remove(&property);
                node.inheritance.remove(&property);
                node.text_value.remove(&property);
                changed = true;
            }

            // Backfill: the next generalization takes over as the default
            // source, including properties the node never had.
            for (property, value) in &next.properties {
                if property == PARTS_PROPERTY || property == IS_PART_OF_PROPERTY {
                    continue;
                }
                if node.properties.contains_key(property) {
                    continue;
                }
                node.properties.insert(property.clone(), value.clone());
                node.inheritance.insert(
                    property.clone(),
                    InheritanceEntry::default_from(Some(next.id.clone())),
                );
                changed = true;
            }

            for child_id in flatten_ids(&node.specializations) {
                queue.push_back(child_id);
            }
            if changed {
                cache.insert(current_id.clone(), node.clone());
                writer.write(node).await?;
            }
        }

        writer.flush().await?;
        debug!(node_id, removed_id, writes = writer.committed(), "generalization-removal cascade finished");
        Ok(())
    }

    /// Whether automated cascades may rewrite this property on this node.
    fn rule_allows_auto_update(node: &Node, property: &str) -> bool {
        match node.inheritance.get(property) {
            Some(entry) => match entry.inheritance_type {
                InheritanceType::AlwaysInherit => true,
                InheritanceType::InheritUnlessAlreadyOverRidden => entry.reference.is_some(),
                InheritanceType::NeverInherit | InheritanceType::InheritAfterReview => false,
            },
            None => false,
        }
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
