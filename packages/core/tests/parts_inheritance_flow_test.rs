//! Parts Inheritance Flow Tests
//!
//! End-to-end coverage of the part-whole relation and the derived
//! `inheritanceParts` cache.
//!
//! ## Scenarios
//!
//! - Inherited parts appear on specializations with origin tracing
//! - A direct part shadows the inherited entry for the same id
//! - Removals propagate cleanly through diamond-shaped subtrees
//! - Mode round trip through a generalization preserves the inherited set
//! - Explicit-source mode: entering resets direct parts, leaving
//!   materializes the inherited set losslessly
//! - Propagation covers subtrees larger than one write batch

use std::sync::Arc;

use anyhow::Result;
use ontology_core::db::{GraphStore, MemoryGraphStore, WriteBatch, MAX_BATCH_WRITES};
use ontology_core::models::{contains_id, Node, NodeRef};
use ontology_core::services::{
    ChangeRecorder, MemoryChangeLog, PartsInheritanceService, PartsService, RelationshipService,
};

struct Fixture {
    store: Arc<MemoryGraphStore>,
    relationships: RelationshipService,
    parts: PartsService,
    parts_inheritance: PartsInheritanceService,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryGraphStore::new());
    let log = Arc::new(MemoryChangeLog::new());
    Fixture {
        store: store.clone(),
        relationships: RelationshipService::new(store.clone(), log.clone()),
        parts: PartsService::new(store.clone(), log.clone()),
        parts_inheritance: PartsInheritanceService::new(store, ChangeRecorder::new(log)),
    }
}

async fn seed(store: &MemoryGraphStore, ids: &[&str]) {
    for id in ids {
        store
            .insert(Node::new_with_id(*id, format!("Node {id}")))
            .await;
    }
}

async fn fetch(store: &MemoryGraphStore, id: &str) -> Result<Node> {
    Ok(store
        .get(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("node {id} missing"))?)
}

#[tokio::test]
async fn specializations_inherit_parts_with_origin_tracing() -> Result<()> {
    let f = fixture();
    seed(&f.store, &["vehicle", "car", "sports car", "engine"]).await;

    f.parts
        .add_parts("vehicle", &[NodeRef::new("engine")], "alice", "r", None)
        .await?;
    f.relationships
        .add_specializations("vehicle", &[NodeRef::new("car")], "alice", "r", None)
        .await?;
    f.relationships
        .add_specializations("car", &[NodeRef::new("sports car")], "alice", "r", None)
        .await?;

    let car = fetch(&f.store, "car").await?;
    assert_eq!(car.inheritance_parts["engine"].inherited_from_id, "vehicle");
    assert_eq!(
        car.inheritance_parts["engine"].inherited_from_title,
        "Node vehicle"
    );

    // Two levels down the origin still points at the defining ancestor.
    let sports = fetch(&f.store, "sports car").await?;
    assert_eq!(
        sports.inheritance_parts["engine"].inherited_from_id,
        "vehicle"
    );
    Ok(())
}

#[tokio::test]
async fn direct_parts_shadow_inherited_entries() -> Result<()> {
    let f = fixture();
    seed(&f.store, &["vehicle", "car", "engine", "v8"]).await;

    f.parts
        .add_parts("vehicle", &[NodeRef::new("engine")], "alice", "r", None)
        .await?;
    f.relationships
        .add_specializations("vehicle", &[NodeRef::new("car")], "alice", "r", None)
        .await?;
    assert!(fetch(&f.store, "car")
        .await?
        .inheritance_parts
        .contains_key("engine"));

    f.parts
        .add_parts("car", &[NodeRef::new("engine")], "alice", "own engine", None)
        .await?;

    let car = fetch(&f.store, "car").await?;
    assert!(contains_id(car.parts(), "engine"));
    assert!(
        !car.inheritance_parts.contains_key("engine"),
        "a part is never both direct and inherited"
    );
    Ok(())
}

#[tokio::test]
async fn mode_round_trip_through_a_generalization_preserves_the_set() -> Result<()> {
    let f = fixture();
    seed(&f.store, &["vehicle", "car", "engine", "wheel"]).await;

    f.parts
        .add_parts(
            "vehicle",
            &[NodeRef::new("engine"), NodeRef::new("wheel")],
            "alice",
            "r",
            None,
        )
        .await?;
    f.relationships
        .add_specializations("vehicle", &[NodeRef::new("car")], "alice", "r", None)
        .await?;
    let before = fetch(&f.store, "car").await?.inheritance_parts;
    assert_eq!(before.len(), 2);

    // Union mode -> explicit source (the same generalization) -> union mode.
    f.parts_inheritance
        .handle_parts_inheritance_change("car", Some("vehicle"), "alice", "pin source")
        .await?;
    f.parts_inheritance
        .handle_parts_inheritance_change("car", None, "alice", "unpin")
        .await?;

    let after = fetch(&f.store, "car").await?.inheritance_parts;
    assert_eq!(before, after);
    Ok(())
}

#[tokio::test]
async fn explicit_source_mode_round_trips_losslessly() -> Result<()> {
    let f = fixture();
    seed(&f.store, &["template", "blade", "handle", "knife"]).await;

    f.parts
        .add_parts(
            "template",
            &[NodeRef::new("blade"), NodeRef::new("handle")],
            "alice",
            "r",
            None,
        )
        .await?;
    f.relationships
        .add_generalizations("knife", &[NodeRef::new("template")], "alice", "r", None)
        .await?;

    // Enter explicit-source mode: the knife mirrors the template's parts.
    f.parts_inheritance
        .handle_parts_inheritance_change("knife", Some("template"), "alice", "use template")
        .await?;
    let knife = fetch(&f.store, "knife").await?;
    assert_eq!(knife.inheritance_parts.len(), 2);
    assert_eq!(
        knife.inheritance_parts["blade"].inherited_from_id,
        "template"
    );

    // Leave the mode: the computed set is materialized, nothing is lost.
    f.parts_inheritance
        .handle_parts_inheritance_change("knife", None, "alice", "detach")
        .await?;
    let knife = fetch(&f.store, "knife").await?;
    assert_eq!(knife.inheritance_parts.len(), 2);
    assert!(knife.inheritance_parts.contains_key("blade"));
    assert!(knife.inheritance_parts.contains_key("handle"));
    Ok(())
}

#[tokio::test]
async fn entering_explicit_mode_resets_direct_parts() -> Result<()> {
    let f = fixture();
    seed(&f.store, &["template", "blade", "knife", "stray"]).await;

    f.parts
        .add_parts("template", &[NodeRef::new("blade")], "alice", "r", None)
        .await?;
    f.parts
        .add_parts("knife", &[NodeRef::new("stray")], "alice", "r", None)
        .await?;
    f.relationships
        .add_generalizations("knife", &[NodeRef::new("template")], "alice", "r", None)
        .await?;

    f.parts_inheritance
        .handle_parts_inheritance_change("knife", Some("template"), "alice", "use template")
        .await?;

    let knife = fetch(&f.store, "knife").await?;
    assert!(
        !contains_id(knife.parts(), "stray"),
        "direct parts are reset when entering explicit mode"
    );
    assert!(knife.inheritance_parts.contains_key("blade"));
    Ok(())
}

#[tokio::test]
async fn parts_removal_clears_diamond_joined_descendants() -> Result<()> {
    let f = fixture();
    seed(&f.store, &["appliance", "washer", "compact", "pump"]).await;

    // Diamond: compact specializes both appliance (directly) and washer;
    // compact sits first in appliance's list, before washer.
    f.relationships
        .add_specializations(
            "appliance",
            &[NodeRef::new("compact"), NodeRef::new("washer")],
            "alice",
            "r",
            None,
        )
        .await?;
    f.relationships
        .add_specializations("washer", &[NodeRef::new("compact")], "alice", "r", None)
        .await?;
    f.parts
        .add_parts("appliance", &[NodeRef::new("pump")], "alice", "r", None)
        .await?;
    assert!(fetch(&f.store, "compact")
        .await?
        .inheritance_parts
        .contains_key("pump"));

    f.parts
        .remove_parts("appliance", &[NodeRef::new("pump")], "alice", "retire")
        .await?;

    let washer = fetch(&f.store, "washer").await?;
    assert!(!washer.inheritance_parts.contains_key("pump"));
    let compact = fetch(&f.store, "compact").await?;
    assert!(
        !compact.inheritance_parts.contains_key("pump"),
        "no stale entry survives through the longer path"
    );
    Ok(())
}

#[tokio::test]
async fn propagation_covers_more_descendants_than_one_batch() -> Result<()> {
    let f = fixture();
    seed(&f.store, &["machine", "gear"]).await;

    let descendant_count = MAX_BATCH_WRITES + 25;
    let ids: Vec<String> = (0..descendant_count).map(|i| format!("unit-{i}")).collect();
    for id in &ids {
        let mut node = Node::new_with_id(id.clone(), format!("Unit {id}"));
        node.generalizations[0].nodes.push(NodeRef::new("machine"));
        f.store.insert(node).await;
    }
    let mut machine = fetch(&f.store, "machine").await?;
    for id in &ids {
        machine.specializations[0].nodes.push(NodeRef::new(id));
    }
    let mut batch = WriteBatch::new();
    batch.push(machine);
    f.store.commit(batch).await?;

    f.parts
        .add_parts("machine", &[NodeRef::new("gear")], "alice", "retrofit", None)
        .await?;

    for id in ids.iter().step_by(101) {
        let unit = fetch(&f.store, id).await?;
        assert_eq!(
            unit.inheritance_parts["gear"].inherited_from_id, "machine",
            "descendant {id} saw the cascade"
        );
    }
    let last = fetch(&f.store, &ids[descendant_count - 1]).await?;
    assert!(last.inheritance_parts.contains_key("gear"));
    Ok(())
}
