//! Test suite for hierarchy links and history propagation

use anyhow::Result;
use pretty_assertions::assert_eq;
use procession::{
    DefinitionBuilder, EngineConfig, HierarchyType, MigrationRequest, ProcessEngine,
    ProcessInstance, ScopeType,
};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

fn engine_with_call_chain() -> Result<ProcessEngine> {
    let engine = ProcessEngine::new(EngineConfig::default())?;
    engine.catalog().deploy(
        DefinitionBuilder::new("top", 1)
            .user_task("prepare")
            .call_activity("delegate", "${targetDefId}")
            .user_task("wrapUp")
            .flow("prepare", "delegate")
            .flow("delegate", "wrapUp")
            .build()?,
    )?;
    engine.catalog().deploy(
        DefinitionBuilder::new("middle", 1)
            .user_task("review")
            .call_activity("escalate", "bottom")
            .flow("review", "escalate")
            .build()?,
    )?;
    engine.catalog().deploy(
        DefinitionBuilder::new("bottom", 1)
            .user_task("resolve")
            .build()?,
    )?;
    Ok(engine)
}

async fn spawn_child(
    engine: &ProcessEngine,
    instance: &ProcessInstance,
    source: &str,
    target: &str,
    call_activity: &str,
) -> Result<ProcessInstance> {
    let result = engine
        .change_state(
            MigrationRequest::for_instance(&instance.id)
                .move_to_subprocess(source, target, call_activity)
                .variable("targetDefId", json!("middle"))
                .build()?,
        )
        .await?;
    Ok(engine
        .store()
        .instance(&result.started_instances[0])
        .expect("spawned instance"))
}

#[tokio::test]
async fn top_level_instances_carry_no_links() -> Result<()> {
    let engine = engine_with_call_chain()?;
    let top = engine.start_process_instance("top", HashMap::new()).await?;
    assert!(engine.link_table().links_for_scope(&top.id).is_empty());
    Ok(())
}

#[tokio::test]
async fn tasks_are_linked_into_their_hierarchy() -> Result<()> {
    let engine = engine_with_call_chain()?;
    let top = engine.start_process_instance("top", HashMap::new()).await?;

    let task = engine
        .store()
        .tasks_at_activity(&top.id, "prepare")
        .pop()
        .expect("start activity is task-backed");
    let links = engine.link_table().links_for_scope(&task.id);
    assert_eq!(links.len(), 2);
    assert!(links
        .iter()
        .all(|l| l.scope_type == ScopeType::Task && l.reference_scope_id == top.id));
    assert!(links
        .iter()
        .any(|l| l.hierarchy_type == HierarchyType::Parent));
    assert!(links.iter().any(|l| l.hierarchy_type == HierarchyType::Root));
    Ok(())
}

#[tokio::test]
async fn task_links_follow_the_token() -> Result<()> {
    let engine = engine_with_call_chain()?;
    let top = engine.start_process_instance("top", HashMap::new()).await?;
    let old_task = engine
        .store()
        .tasks_at_activity(&top.id, "prepare")
        .pop()
        .unwrap();

    engine
        .change_state(
            MigrationRequest::for_instance(&top.id)
                .move_activity("prepare", "wrapUp")
                .build()?,
        )
        .await?;

    assert!(engine.link_table().links_for_scope(&old_task.id).is_empty());
    let new_task = engine
        .store()
        .tasks_at_activity(&top.id, "wrapUp")
        .pop()
        .unwrap();
    assert_eq!(engine.link_table().links_for_scope(&new_task.id).len(), 2);
    Ok(())
}

#[tokio::test]
async fn rooted_links_cover_the_whole_hierarchy() -> Result<()> {
    let engine = engine_with_call_chain()?;
    let top = engine.start_process_instance("top", HashMap::new()).await?;
    let middle = spawn_child(&engine, &top, "prepare", "review", "delegate").await?;

    // One ROOT link per scope below the top: the middle instance and the
    // task sitting at its start activity
    let rooted = engine.link_table().links_rooted_at(&top.id);
    assert_eq!(rooted.len(), 2);
    assert!(rooted
        .iter()
        .any(|l| l.scope_id == middle.id && l.scope_type == ScopeType::ProcessInstance));
    assert!(rooted.iter().any(|l| l.scope_type == ScopeType::Task));
    Ok(())
}

#[tokio::test]
async fn parent_links_walk_back_to_the_root_target() -> Result<()> {
    let engine = engine_with_call_chain()?;
    let top = engine.start_process_instance("top", HashMap::new()).await?;
    let middle = spawn_child(&engine, &top, "prepare", "review", "delegate").await?;
    let result = engine
        .change_state(
            MigrationRequest::for_instance(&middle.id)
                .move_to_subprocess("review", "resolve", "escalate")
                .build()?,
        )
        .await?;
    let bottom_id = result.started_instances[0].clone();

    // Follow PARENT links from the deepest scope; the walk must end at
    // the scope the ROOT link names
    let root_target = engine
        .link_table()
        .root_link(&bottom_id)
        .unwrap()
        .reference_scope_id;
    let mut current = bottom_id.clone();
    while let Some(link) = engine.link_table().parent_link(&current) {
        current = link.reference_scope_id;
    }
    assert_eq!(current, root_target);
    assert_eq!(current, top.id);
    Ok(())
}

#[tokio::test]
async fn terminating_a_subtree_spares_the_rest_of_the_hierarchy() -> Result<()> {
    let engine = engine_with_call_chain()?;
    let top = engine.start_process_instance("top", HashMap::new()).await?;
    let middle = spawn_child(&engine, &top, "prepare", "review", "delegate").await?;
    let result = engine
        .change_state(
            MigrationRequest::for_instance(&middle.id)
                .move_to_subprocess("review", "resolve", "escalate")
                .build()?,
        )
        .await?;
    let bottom_id = result.started_instances[0].clone();

    // Collapsing the middle instance takes the bottom one with it
    engine
        .change_state(
            MigrationRequest::for_instance(&middle.id)
                .move_to_parent("escalate", "wrapUp")
                .build()?,
        )
        .await?;

    assert!(engine.link_table().links_for_scope(&middle.id).is_empty());
    assert!(engine.link_table().links_for_scope(&bottom_id).is_empty());
    assert!(engine.store().instance(&bottom_id).is_none());

    // The surviving top-level task got fresh links; it is the only
    // scope left under the root
    let task = engine
        .store()
        .tasks_at_activity(&top.id, "wrapUp")
        .pop()
        .unwrap();
    assert_eq!(engine.link_table().links_for_scope(&task.id).len(), 2);
    let rooted = engine.link_table().links_rooted_at(&top.id);
    assert_eq!(rooted.len(), 1);
    assert_eq!(rooted[0].scope_id, task.id);
    Ok(())
}

#[tokio::test]
async fn ended_hierarchies_survive_in_history() -> Result<()> {
    let engine = engine_with_call_chain()?;
    let top = engine.start_process_instance("top", HashMap::new()).await?;
    let middle = spawn_child(&engine, &top, "prepare", "review", "delegate").await?;
    let result = engine
        .change_state(
            MigrationRequest::for_instance(&middle.id)
                .move_to_subprocess("review", "resolve", "escalate")
                .build()?,
        )
        .await?;
    let bottom_id = result.started_instances[0].clone();

    engine
        .change_state(
            MigrationRequest::for_instance(&middle.id)
                .move_to_parent("escalate", "wrapUp")
                .build()?,
        )
        .await?;
    engine.wait_for_history(Duration::from_secs(2)).await?;

    // Both terminated instances keep their historical record
    assert_eq!(engine.history().ended_instance_count(), 2);
    assert!(engine.history().instance(&middle.id).unwrap().ended_ms.is_some());
    assert!(engine.history().instance(&bottom_id).unwrap().ended_ms.is_some());
    assert!(engine.history().instance(&top.id).unwrap().ended_ms.is_none());
    Ok(())
}
