//! Test suite for the change-state migration command

use anyhow::Result;
use pretty_assertions::assert_eq;
use procession::{
    DefinitionBuilder, EngineConfig, MigrationRequest, ProcessEngine, ProcessInstance,
    ProcessionError,
};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Engine with a parent process, two versions of a callable subprocess
/// (the second one drops `extraTask`), and a leaf process reachable
/// through a literal call activity in the subprocess.
fn engine_with_definitions() -> Result<ProcessEngine> {
    init_tracing();
    let engine = ProcessEngine::new(EngineConfig::default())?;

    engine.catalog().deploy(
        DefinitionBuilder::new("parentProcess", 1)
            .user_task("firstTask")
            .call_activity("callActivity", "${subProcessDefId}")
            .user_task("secondTask")
            .flow("firstTask", "callActivity")
            .flow("callActivity", "secondTask")
            .build()?,
    )?;

    engine.catalog().deploy(
        DefinitionBuilder::new("subProcess", 1)
            .user_task("theTask")
            .user_task("extraTask")
            .call_activity("nestedCall", "leafProcess")
            .flow("theTask", "nestedCall")
            .build()?,
    )?;
    engine.catalog().deploy(
        DefinitionBuilder::new("subProcess", 2)
            .user_task("theTask")
            .call_activity("nestedCall", "leafProcess")
            .flow("theTask", "nestedCall")
            .build()?,
    )?;

    engine.catalog().deploy(
        DefinitionBuilder::new("leafProcess", 1)
            .user_task("finalTask")
            .build()?,
    )?;

    Ok(engine)
}

async fn start_parent(engine: &ProcessEngine) -> Result<ProcessInstance> {
    Ok(engine
        .start_process_instance("parentProcess", HashMap::new())
        .await?)
}

/// Migrate the parent's `firstTask` token into a fresh subprocess
/// instance sitting at `theTask`.
async fn migrate_into_subprocess(
    engine: &ProcessEngine,
    parent: &ProcessInstance,
) -> Result<ProcessInstance> {
    let request = MigrationRequest::for_instance(&parent.id)
        .move_to_subprocess("firstTask", "theTask", "callActivity")
        .variable("subProcessDefId", json!("subProcess"))
        .build()?;
    let result = engine.change_state(request).await?;
    assert_eq!(result.started_instances.len(), 1);
    let child = engine
        .store()
        .instance(&result.started_instances[0])
        .expect("spawned child instance must exist");
    Ok(child)
}

fn leaf_activity_ids(engine: &ProcessEngine, instance_id: &str) -> Vec<String> {
    let mut ids: Vec<String> = engine
        .store()
        .leaf_executions(instance_id, None)
        .into_iter()
        .filter_map(|e| e.activity_id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn within_instance_move_conserves_leaves() -> Result<()> {
    let engine = engine_with_definitions()?;
    let instance = start_parent(&engine).await?;
    assert_eq!(leaf_activity_ids(&engine, &instance.id), vec!["firstTask"]);

    let request = MigrationRequest::for_instance(&instance.id)
        .move_activity("firstTask", "secondTask")
        .build()?;
    let result = engine.change_state(request).await?;

    // Same leaf count, source activity replaced by the target
    assert_eq!(leaf_activity_ids(&engine, &instance.id), vec!["secondTask"]);
    assert_eq!(result.refreshed_tokens[&instance.id].len(), 1);
    assert!(engine
        .store()
        .tasks_at_activity(&instance.id, "firstTask")
        .is_empty());
    assert_eq!(
        engine
            .store()
            .tasks_at_activity(&instance.id, "secondTask")
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn same_activity_move_is_an_idempotent_refresh() -> Result<()> {
    let engine = engine_with_definitions()?;
    let instance = start_parent(&engine).await?;
    let leaf_before = engine.store().leaf_executions(&instance.id, None)[0].clone();
    let task_before = engine
        .store()
        .task_for_execution(&leaf_before.id)
        .expect("firstTask is task-backed");

    let request = MigrationRequest::for_instance(&instance.id)
        .move_activity("firstTask", "firstTask")
        .build()?;
    engine.change_state(request).await?;

    // Execution pointer untouched, task rebuilt
    let leaves = engine.store().leaf_executions(&instance.id, None);
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].id, leaf_before.id);
    let task_after = engine
        .store()
        .task_for_execution(&leaf_before.id)
        .expect("task is recreated by the refresh");
    assert_ne!(task_after.id, task_before.id);
    assert_eq!(task_after.task_definition_key, "firstTask");
    Ok(())
}

#[tokio::test]
async fn failed_batch_leaves_state_untouched() -> Result<()> {
    let engine = engine_with_definitions()?;
    let instance = start_parent(&engine).await?;

    let leaves_before = leaf_activity_ids(&engine, &instance.id);
    let mut task_ids_before: Vec<String> = engine
        .store()
        .tasks_for_instance(&instance.id)
        .into_iter()
        .map(|t| t.id)
        .collect();
    task_ids_before.sort();
    let links_before = engine.link_table().len();
    let instances_before = engine.store().instance_count();

    // One valid move plus one with no source token
    let request = MigrationRequest::for_instance(&instance.id)
        .move_activity("firstTask", "secondTask")
        .move_activity("ghostTask", "secondTask")
        .build()?;
    let err = engine.change_state(request).await.unwrap_err();
    assert!(matches!(err, ProcessionError::SourceTokenNotFound { .. }));

    // A bad target aborts just the same
    let request = MigrationRequest::for_instance(&instance.id)
        .move_activity("firstTask", "ghostTask")
        .build()?;
    let err = engine.change_state(request).await.unwrap_err();
    assert!(matches!(err, ProcessionError::ActivityNotFound { .. }));

    assert_eq!(leaf_activity_ids(&engine, &instance.id), leaves_before);
    let mut task_ids_after: Vec<String> = engine
        .store()
        .tasks_for_instance(&instance.id)
        .into_iter()
        .map(|t| t.id)
        .collect();
    task_ids_after.sort();
    assert_eq!(task_ids_after, task_ids_before);
    assert_eq!(engine.link_table().len(), links_before);
    assert_eq!(engine.store().instance_count(), instances_before);
    Ok(())
}

#[tokio::test]
async fn unresolved_expression_gates_the_whole_command() -> Result<()> {
    let engine = engine_with_definitions()?;
    let instance = start_parent(&engine).await?;

    // No subProcessDefId variable supplied
    let request = MigrationRequest::for_instance(&instance.id)
        .move_to_subprocess("firstTask", "theTask", "callActivity")
        .build()?;
    let err = engine.change_state(request).await.unwrap_err();
    match &err {
        ProcessionError::ExpressionResolution {
            expression,
            call_activity_id,
            ..
        } => {
            assert_eq!(expression, "${subProcessDefId}");
            assert_eq!(call_activity_id, "callActivity");
        }
        other => panic!("expected ExpressionResolution, got {:?}", other),
    }
    assert!(err.to_string().contains("${subProcessDefId}"));
    assert!(err.to_string().contains("callActivity"));

    // Nothing moved, nothing spawned
    assert_eq!(leaf_activity_ids(&engine, &instance.id), vec!["firstTask"]);
    assert_eq!(engine.store().instance_count(), 1);

    // Supplying the variable makes the same request succeed
    let request = MigrationRequest::for_instance(&instance.id)
        .move_to_subprocess("firstTask", "theTask", "callActivity")
        .variable("subProcessDefId", json!("subProcess"))
        .build()?;
    let result = engine.change_state(request).await?;
    assert_eq!(result.started_instances.len(), 1);
    assert_eq!(engine.store().instance_count(), 2);
    Ok(())
}

#[tokio::test]
async fn move_into_subprocess_spawns_and_links() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;
    let child = migrate_into_subprocess(&engine, &parent).await?;

    // Exactly one new instance, super-linked to the source instance
    let spawned = engine.store().instances_by_super_instance(&parent.id);
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].id, child.id);
    assert_eq!(child.definition_version, 2); // latest wins unpinned

    let super_execution = engine
        .store()
        .execution(child.super_execution_id.as_deref().unwrap())
        .expect("super execution is the parked call-activity token");
    assert_eq!(super_execution.instance_id, parent.id);
    assert_eq!(super_execution.activity_id.as_deref(), Some("callActivity"));

    // PARENT and ROOT links for the child
    let parent_link = engine.link_table().parent_link(&child.id).unwrap();
    assert_eq!(parent_link.reference_scope_id, parent.id);
    let root_link = engine.link_table().root_link(&child.id).unwrap();
    assert_eq!(root_link.reference_scope_id, parent.id);

    // Source instance keeps its leaf count but no task at the migrated
    // activity remains
    assert_eq!(leaf_activity_ids(&engine, &parent.id), vec!["callActivity"]);
    assert!(engine
        .store()
        .tasks_at_activity(&parent.id, "firstTask")
        .is_empty());
    assert_eq!(leaf_activity_ids(&engine, &child.id), vec!["theTask"]);
    assert_eq!(engine.store().tasks_at_activity(&child.id, "theTask").len(), 1);
    Ok(())
}

#[tokio::test]
async fn root_links_point_at_the_ultimate_top_level_instance() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;
    let child = migrate_into_subprocess(&engine, &parent).await?;

    // Push the child's token one level deeper through the literal call
    let request = MigrationRequest::for_instance(&child.id)
        .move_to_subprocess("theTask", "finalTask", "nestedCall")
        .build()?;
    let result = engine.change_state(request).await?;
    let grandchild_id = &result.started_instances[0];

    assert_eq!(
        engine
            .link_table()
            .parent_link(grandchild_id)
            .unwrap()
            .reference_scope_id,
        child.id
    );
    assert_eq!(
        engine
            .link_table()
            .root_link(grandchild_id)
            .unwrap()
            .reference_scope_id,
        parent.id
    );
    assert_eq!(engine.store().root_instance_of(grandchild_id), parent.id);
    Ok(())
}

#[tokio::test]
async fn move_out_to_parent_collapses_the_hierarchy() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;
    let child = migrate_into_subprocess(&engine, &parent).await?;

    let request = MigrationRequest::for_instance(&child.id)
        .move_to_parent("theTask", "secondTask")
        .build()?;
    let result = engine.change_state(request).await?;
    assert!(result.terminated_instances.contains(&child.id));

    // The child hierarchy is gone
    assert!(engine
        .store()
        .instances_by_super_instance(&parent.id)
        .is_empty());
    assert!(engine.store().instance(&child.id).is_none());
    assert!(engine.link_table().links_for_scope(&child.id).is_empty());

    // The parent resumed with a single token at the target activity
    assert_eq!(leaf_activity_ids(&engine, &parent.id), vec!["secondTask"]);
    let scope = engine
        .store()
        .executions_for_instance(&parent.id)
        .into_iter()
        .find(|e| e.is_scope)
        .expect("parent keeps its scope execution");
    assert_eq!(engine.store().child_executions(&scope.id).len(), 1);
    assert_eq!(
        engine
            .store()
            .tasks_at_activity(&parent.id, "secondTask")
            .len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn migrating_the_call_activity_token_terminates_its_child() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;
    let child = migrate_into_subprocess(&engine, &parent).await?;

    // The parked token's lifecycle is coupled to the child instance:
    // forcing it away terminates the child in full
    let request = MigrationRequest::for_instance(&parent.id)
        .move_activity("callActivity", "secondTask")
        .build()?;
    let result = engine.change_state(request).await?;

    assert!(result.terminated_instances.contains(&child.id));
    assert!(engine.store().instance(&child.id).is_none());
    assert!(engine
        .store()
        .instances_by_super_instance(&parent.id)
        .is_empty());
    assert!(engine.link_table().links_for_scope(&child.id).is_empty());
    assert_eq!(leaf_activity_ids(&engine, &parent.id), vec!["secondTask"]);
    Ok(())
}

#[tokio::test]
async fn pinned_version_exposes_activities_missing_from_latest() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;

    // extraTask only exists in subProcess version 1; latest is 2
    let request = MigrationRequest::for_instance(&parent.id)
        .move_to_subprocess("firstTask", "extraTask", "callActivity")
        .variable("subProcessDefId", json!("subProcess"))
        .build()?;
    let err = engine.change_state(request).await.unwrap_err();
    match &err {
        ProcessionError::ActivityNotFound {
            activity_id,
            definition_id,
        } => {
            assert_eq!(activity_id, "extraTask");
            assert_eq!(definition_id, "subProcess:2");
        }
        other => panic!("expected ActivityNotFound, got {:?}", other),
    }

    let request = MigrationRequest::for_instance(&parent.id)
        .move_to_subprocess_version("firstTask", "extraTask", "callActivity", 1)
        .variable("subProcessDefId", json!("subProcess"))
        .build()?;
    let result = engine.change_state(request).await?;
    let child = engine
        .store()
        .instance(&result.started_instances[0])
        .unwrap();
    assert_eq!(child.definition_version, 1);
    assert_eq!(leaf_activity_ids(&engine, &child.id), vec!["extraTask"]);
    Ok(())
}

#[tokio::test]
async fn unknown_called_definition_is_rejected() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;

    let request = MigrationRequest::for_instance(&parent.id)
        .move_to_subprocess("firstTask", "theTask", "callActivity")
        .variable("subProcessDefId", json!("missingProcess"))
        .build()?;
    assert!(matches!(
        engine.change_state(request).await.unwrap_err(),
        ProcessionError::DefinitionNotFound { version: None, .. }
    ));

    let request = MigrationRequest::for_instance(&parent.id)
        .move_to_subprocess_version("firstTask", "theTask", "callActivity", 9)
        .variable("subProcessDefId", json!("subProcess"))
        .build()?;
    assert!(matches!(
        engine.change_state(request).await.unwrap_err(),
        ProcessionError::DefinitionNotFound {
            version: Some(9),
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn move_to_parent_needs_a_parent() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;

    let request = MigrationRequest::for_instance(&parent.id)
        .move_to_parent("firstTask", "secondTask")
        .build()?;
    assert!(matches!(
        engine.change_state(request).await.unwrap_err(),
        ProcessionError::Validation { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn history_reflects_migrations_after_drain() -> Result<()> {
    let engine = engine_with_definitions()?;
    let parent = start_parent(&engine).await?;
    let child = migrate_into_subprocess(&engine, &parent).await?;

    let request = MigrationRequest::for_instance(&child.id)
        .move_to_parent("theTask", "secondTask")
        .build()?;
    engine.change_state(request).await?;

    // History is eventually consistent; poll until the queue drains
    engine.wait_for_history(Duration::from_secs(2)).await?;

    let historic_child = engine.history().instance(&child.id).unwrap();
    assert_eq!(historic_child.super_instance_id.as_deref(), Some(parent.id.as_str()));
    assert!(historic_child.ended_ms.is_some());
    assert!(historic_child.started_ms <= historic_child.ended_ms.unwrap());

    let historic_parent = engine.history().instance(&parent.id).unwrap();
    assert!(historic_parent.ended_ms.is_none());
    assert_eq!(engine.history().ended_instance_count(), 1);
    Ok(())
}

#[tokio::test]
async fn disjoint_hierarchies_migrate_concurrently() -> Result<()> {
    let engine = engine_with_definitions()?;
    let first = start_parent(&engine).await?;
    let second = start_parent(&engine).await?;

    let request_a = MigrationRequest::for_instance(&first.id)
        .move_activity("firstTask", "secondTask")
        .build()?;
    let request_b = MigrationRequest::for_instance(&second.id)
        .move_activity("firstTask", "secondTask")
        .build()?;
    let (a, b) = tokio::join!(
        engine.change_state(request_a),
        engine.change_state(request_b)
    );
    a?;
    b?;

    assert_eq!(leaf_activity_ids(&engine, &first.id), vec!["secondTask"]);
    assert_eq!(leaf_activity_ids(&engine, &second.id), vec!["secondTask"]);
    Ok(())
}
