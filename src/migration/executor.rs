use crate::core::errors::{ProcessionError, Result};
use crate::definition::model::ProcessDefinition;
use crate::history::events::LifecycleEvent;
use crate::links::HierarchyLinkSynchronizer;
use crate::migration::planner::{MigrationPlan, PlannedMove, PlannedMoveKind};
use crate::tree::model::Execution;
use crate::tree::store::ExecutionTreeStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Outcome of a successfully applied plan
#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub process_instance_id: String,
    /// Leaf executions per touched, still-live instance after the batch
    pub refreshed_tokens: HashMap<String, Vec<Execution>>,
    pub started_instances: Vec<String>,
    pub terminated_instances: Vec<String>,
}

/// A result plus the lifecycle events to publish once the surrounding
/// transaction commits
#[derive(Debug)]
pub struct AppliedMigration {
    pub result: MigrationResult,
    pub events: Vec<LifecycleEvent>,
}

/// Applies a validated plan to the execution tree: all-or-nothing over
/// the batch. Rollback on failure is the command's job (snapshot
/// restore); the executor only mutates and self-checks.
pub struct MigrationExecutor {
    store: Arc<ExecutionTreeStore>,
    links: Arc<HierarchyLinkSynchronizer>,
    strict_consistency_check: bool,
}

impl MigrationExecutor {
    pub fn new(
        store: Arc<ExecutionTreeStore>,
        links: Arc<HierarchyLinkSynchronizer>,
        strict_consistency_check: bool,
    ) -> Self {
        Self {
            store,
            links,
            strict_consistency_check,
        }
    }

    pub fn apply(&self, plan: &MigrationPlan) -> Result<AppliedMigration> {
        let mut events = Vec::new();
        let mut started_instances = Vec::new();
        let mut terminated_instances = Vec::new();
        let mut touched = Vec::new();

        for planned in &plan.moves {
            match &planned.kind {
                PlannedMoveKind::WithinInstance {
                    definition,
                    refresh_only,
                } => {
                    let terminated =
                        self.apply_within_instance(planned, definition, *refresh_only, &mut events)?;
                    terminated_instances.extend(terminated);
                    touched.push(plan.process_instance_id.clone());
                }
                PlannedMoveKind::IntoSubprocess {
                    call_activity_id,
                    child_definition,
                } => {
                    let (child_id, terminated) = self.apply_into_subprocess(
                        planned,
                        call_activity_id,
                        child_definition,
                        &plan.variables,
                        &mut events,
                    )?;
                    terminated_instances.extend(terminated);
                    touched.push(plan.process_instance_id.clone());
                    touched.push(child_id.clone());
                    started_instances.push(child_id);
                }
                PlannedMoveKind::ToParent {
                    parent_instance_id,
                    parent_execution_id,
                    parent_definition,
                } => {
                    let terminated = self.apply_to_parent(
                        planned,
                        parent_instance_id,
                        parent_execution_id,
                        parent_definition,
                        &mut events,
                    )?;
                    touched.push(parent_instance_id.clone());
                    terminated_instances.extend(terminated);
                }
            }
        }

        let mut refreshed_tokens = HashMap::new();
        touched.sort();
        touched.dedup();
        for instance_id in touched {
            if self.store.instance(&instance_id).is_some() {
                refreshed_tokens.insert(
                    instance_id.clone(),
                    self.store.leaf_executions(&instance_id, None),
                );
            }
        }

        info!(
            process_instance_id = plan.process_instance_id,
            moves = plan.moves.len(),
            started = started_instances.len(),
            terminated = terminated_instances.len(),
            "Applied migration plan"
        );
        Ok(AppliedMigration {
            result: MigrationResult {
                process_instance_id: plan.process_instance_id.clone(),
                refreshed_tokens,
                started_instances,
                terminated_instances,
            },
            events,
        })
    }

    fn apply_within_instance(
        &self,
        planned: &PlannedMove,
        definition: &Arc<ProcessDefinition>,
        refresh_only: bool,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<Vec<String>> {
        let source = self.require_planned_execution(&planned.source_execution_id)?;
        let instance_id = source.instance_id.clone();
        let leaves_before = self.store.leaf_executions(&instance_id, None).len();
        let target_node = definition.require_activity(&planned.target_activity_id)?;

        let terminated = if refresh_only {
            // The execution pointer stays put; the task and its links are
            // rebuilt to pull task state back in line.
            if let Some(task) = self.store.delete_task_for_execution(&source.id) {
                self.links.task_removed(&task.id);
            }
            if target_node.creates_task() {
                let task = self
                    .store
                    .create_task(&source, &planned.target_activity_id)?;
                self.links.task_created(&task);
            }
            Vec::new()
        } else {
            let terminated = self.end_source_execution(&source, events)?;

            let replacement = self.store.create_execution(
                &instance_id,
                source.parent_id.clone(),
                Some(planned.target_activity_id.clone()),
                false,
                source.is_concurrent,
            )?;
            events.push(LifecycleEvent::ExecutionCreated {
                instance_id: instance_id.clone(),
                execution_id: replacement.id.clone(),
                activity_id: replacement.activity_id.clone(),
            });
            if target_node.creates_task() {
                let task = self
                    .store
                    .create_task(&replacement, &planned.target_activity_id)?;
                self.links.task_created(&task);
            }
            terminated
        };

        self.assert_leaf_count(&instance_id, leaves_before)?;
        Ok(terminated)
    }

    fn apply_into_subprocess(
        &self,
        planned: &PlannedMove,
        call_activity_id: &str,
        child_definition: &Arc<ProcessDefinition>,
        variables: &HashMap<String, serde_json::Value>,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<(String, Vec<String>)> {
        let source = self.require_planned_execution(&planned.source_execution_id)?;
        let instance_id = source.instance_id.clone();
        let leaves_before = self.store.leaf_executions(&instance_id, None).len();

        // The call activity becomes the spawning point: an execution
        // parks there for as long as the child instance lives.
        let parked = self.store.create_execution(
            &instance_id,
            source.parent_id.clone(),
            Some(call_activity_id.to_string()),
            false,
            source.is_concurrent,
        )?;
        events.push(LifecycleEvent::ExecutionCreated {
            instance_id: instance_id.clone(),
            execution_id: parked.id.clone(),
            activity_id: parked.activity_id.clone(),
        });

        let child = self.store.create_process_instance(
            child_definition,
            &planned.target_activity_id,
            Some(parked.id.clone()),
            variables.clone(),
        )?;
        self.links.instance_started(&child.instance.id, &instance_id);
        events.push(LifecycleEvent::ProcessInstanceStarted {
            instance_id: child.instance.id.clone(),
            definition_id: child_definition.id().to_string(),
            super_instance_id: Some(instance_id.clone()),
        });
        events.push(LifecycleEvent::ExecutionCreated {
            instance_id: child.instance.id.clone(),
            execution_id: child.scope_execution.id.clone(),
            activity_id: None,
        });
        events.push(LifecycleEvent::ExecutionCreated {
            instance_id: child.instance.id.clone(),
            execution_id: child.initial_execution.id.clone(),
            activity_id: child.initial_execution.activity_id.clone(),
        });
        if let Some(task) = &child.initial_task {
            self.links.task_created(task);
        }

        // Child exists and is linked; now the source token ends
        let terminated = self.end_source_execution(&source, events)?;

        self.assert_leaf_count(&instance_id, leaves_before)?;
        self.assert_leaf_count(&child.instance.id, 1)?;
        Ok((child.instance.id, terminated))
    }

    fn apply_to_parent(
        &self,
        planned: &PlannedMove,
        parent_instance_id: &str,
        parent_execution_id: &str,
        parent_definition: &Arc<ProcessDefinition>,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<Vec<String>> {
        let source = self.require_planned_execution(&planned.source_execution_id)?;
        let child_instance_id = source.instance_id.clone();
        let parent_execution = self.require_planned_execution(parent_execution_id)?;
        let parent_leaves_before = self.store.leaf_executions(parent_instance_id, None).len();

        let terminated = self.terminate_instance_tree(&child_instance_id, events)?;

        // The parent token parked at the call activity resumes at the
        // target activity.
        let updated = self.store.update_execution_activity(
            &parent_execution.id,
            Some(planned.target_activity_id.clone()),
        )?;
        events.push(LifecycleEvent::ExecutionEnded {
            instance_id: parent_instance_id.to_string(),
            execution_id: parent_execution.id.clone(),
            activity_id: parent_execution.activity_id.clone(),
        });
        events.push(LifecycleEvent::ExecutionCreated {
            instance_id: parent_instance_id.to_string(),
            execution_id: updated.id.clone(),
            activity_id: updated.activity_id.clone(),
        });

        let target_node = parent_definition.require_activity(&planned.target_activity_id)?;
        if target_node.creates_task() {
            let task = self
                .store
                .create_task(&updated, &planned.target_activity_id)?;
            self.links.task_created(&task);
        }

        self.assert_leaf_count(parent_instance_id, parent_leaves_before)?;
        Ok(terminated)
    }

    /// End a source token: child instances coupled to it are terminated
    /// first (a call-activity token owns the instance it spawned), then
    /// the execution and its task go.
    fn end_source_execution(
        &self,
        source: &Execution,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<Vec<String>> {
        let mut terminated = Vec::new();
        for child in self.store.instances_by_super_execution(&source.id) {
            terminated.extend(self.terminate_instance_tree(&child.id, events)?);
        }

        let removed = self.store.delete_execution(&source.id)?;
        for task in &removed.tasks {
            self.links.task_removed(&task.id);
        }
        events.push(LifecycleEvent::ExecutionEnded {
            instance_id: source.instance_id.clone(),
            execution_id: source.id.clone(),
            activity_id: source.activity_id.clone(),
        });
        Ok(terminated)
    }

    /// Terminate one instance hierarchy, sync its links away and emit
    /// end events, children before parents
    fn terminate_instance_tree(
        &self,
        instance_id: &str,
        events: &mut Vec<LifecycleEvent>,
    ) -> Result<Vec<String>> {
        let removed = self.store.terminate_process_instance(instance_id)?;
        let removed_instance_ids: Vec<String> =
            removed.instances.iter().map(|i| i.id.clone()).collect();
        let removed_task_ids: Vec<String> = removed.tasks.iter().map(|t| t.id.clone()).collect();
        self.links
            .instances_terminated(&removed_instance_ids, &removed_task_ids);

        for execution in &removed.executions {
            events.push(LifecycleEvent::ExecutionEnded {
                instance_id: execution.instance_id.clone(),
                execution_id: execution.id.clone(),
                activity_id: execution.activity_id.clone(),
            });
        }
        for instance in &removed.instances {
            events.push(LifecycleEvent::ProcessInstanceEnded {
                instance_id: instance.id.clone(),
                definition_id: instance.definition_id.clone(),
            });
        }
        Ok(removed_instance_ids)
    }

    fn require_planned_execution(&self, execution_id: &str) -> Result<Execution> {
        self.store.execution(execution_id).ok_or_else(|| {
            ProcessionError::internal_consistency(format!(
                "planned execution '{}' vanished before application",
                execution_id
            ))
        })
    }

    /// The concurrency invariant: after a move, the leaf count of every
    /// touched instance must match the count the plan accounted for. A
    /// mismatch is a defect in the planner or a race past the hierarchy
    /// lock, never a user error.
    fn assert_leaf_count(&self, instance_id: &str, expected: usize) -> Result<()> {
        let actual = self.store.leaf_executions(instance_id, None).len();
        if actual == expected {
            return Ok(());
        }
        let error = ProcessionError::internal_consistency_in(
            format!(
                "expected {} concurrent tokens after migration, found {}",
                expected, actual
            ),
            instance_id,
        );
        if self.strict_consistency_check {
            return Err(error);
        }
        warn!(instance_id, expected, actual, "Concurrency self-check failed");
        Ok(())
    }
}
