use crate::core::errors::{ProcessionError, Result};
use crate::definition::catalog::DefinitionCatalog;
use crate::definition::model::ProcessDefinition;
use crate::definition::resolver::CallActivityResolver;
use crate::migration::request::{MigrationRequest, MoveSpec};
use crate::tree::store::ExecutionTreeStore;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A single validated move with everything the executor needs resolved
#[derive(Debug, Clone)]
pub struct PlannedMove {
    pub source_activity_id: String,
    pub target_activity_id: String,
    pub source_execution_id: String,
    pub kind: PlannedMoveKind,
}

#[derive(Debug, Clone)]
pub enum PlannedMoveKind {
    WithinInstance {
        definition: Arc<ProcessDefinition>,
        /// Source and target are the same activity: legal, refreshes the
        /// task without touching the execution pointer
        refresh_only: bool,
    },
    IntoSubprocess {
        call_activity_id: String,
        child_definition: Arc<ProcessDefinition>,
    },
    ToParent {
        parent_instance_id: String,
        parent_execution_id: String,
        parent_definition: Arc<ProcessDefinition>,
    },
}

/// A fully validated batch, ready for all-or-nothing application
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub process_instance_id: String,
    pub moves: Vec<PlannedMove>,
    pub variables: HashMap<String, Value>,
}

/// Validates a whole migration request against the current tree and the
/// definition catalog. Planning is pure: the tree is never mutated, not
/// even transiently, and any failure aborts the entire batch.
pub struct MigrationPlanner {
    store: Arc<ExecutionTreeStore>,
    catalog: Arc<DefinitionCatalog>,
    resolver: CallActivityResolver,
}

// Intermediate per-move resolution carried between validation passes
enum ResolvedTarget {
    Within {
        definition: Arc<ProcessDefinition>,
    },
    Subprocess {
        call_activity_id: String,
        child_definition: Arc<ProcessDefinition>,
    },
    Parent {
        parent_instance_id: String,
        parent_execution_id: String,
        parent_definition: Arc<ProcessDefinition>,
    },
}

impl MigrationPlanner {
    pub fn new(
        store: Arc<ExecutionTreeStore>,
        catalog: Arc<DefinitionCatalog>,
        resolver: CallActivityResolver,
    ) -> Self {
        Self {
            store,
            catalog,
            resolver,
        }
    }

    /// Validate the request in fail-fast order: (a) resolve every
    /// referenced definition and expression, (b) verify each source
    /// token exists as exactly one leaf, (c) verify each target activity
    /// exists in its resolving definition.
    pub fn plan(&self, request: &MigrationRequest) -> Result<MigrationPlan> {
        let instance = self.store.require_instance(&request.process_instance_id)?;
        let instance_definition = self.catalog.require_id(&instance.definition_id)?;

        // Pass (a): definition/expression resolution for the whole batch
        let mut resolved = Vec::with_capacity(request.moves.len());
        for spec in &request.moves {
            let target = match spec {
                MoveSpec::WithinInstance { .. } => ResolvedTarget::Within {
                    definition: instance_definition.clone(),
                },
                MoveSpec::IntoSubprocess {
                    call_activity_id,
                    definition_version,
                    ..
                } => {
                    let node = instance_definition.require_call_activity(call_activity_id)?;
                    let child_definition = self.resolver.resolve(
                        node,
                        *definition_version,
                        &request.variables,
                    )?;
                    ResolvedTarget::Subprocess {
                        call_activity_id: call_activity_id.clone(),
                        child_definition,
                    }
                }
                MoveSpec::ToParent { .. } => {
                    let parent_execution_id =
                        instance.super_execution_id.clone().ok_or_else(|| {
                            ProcessionError::validation(format!(
                                "process instance '{}' has no parent to move into",
                                instance.id
                            ))
                        })?;
                    let parent_execution = self.store.require_execution(&parent_execution_id)?;
                    let parent_instance =
                        self.store.require_instance(&parent_execution.instance_id)?;
                    let parent_definition =
                        self.catalog.require_id(&parent_instance.definition_id)?;
                    ResolvedTarget::Parent {
                        parent_instance_id: parent_instance.id,
                        parent_execution_id,
                        parent_definition,
                    }
                }
            };
            resolved.push(target);
        }

        // Pass (b): every source activity holds exactly one leaf token
        let mut seen_sources = HashSet::new();
        let mut source_executions = Vec::with_capacity(request.moves.len());
        for spec in &request.moves {
            let source = spec.source_activity_id();
            if !seen_sources.insert(source.to_string()) {
                return Err(ProcessionError::validation(format!(
                    "activity '{}' is the source of more than one move in the batch",
                    source
                )));
            }
            let leaves = self.store.leaf_executions(&instance.id, Some(source));
            match leaves.len() {
                0 => {
                    return Err(ProcessionError::source_token_not_found(
                        source,
                        instance.id.clone(),
                    ))
                }
                1 => source_executions.push(leaves.into_iter().next().unwrap()),
                n => {
                    return Err(ProcessionError::validation(format!(
                        "activity '{}' in instance '{}' holds {} concurrent tokens; \
                         migration needs exactly one",
                        source, instance.id, n
                    )))
                }
            }
        }

        // Pass (c): every target activity exists in its definition
        for (spec, target) in request.moves.iter().zip(&resolved) {
            let target_activity = spec.target_activity_id();
            let definition = match target {
                ResolvedTarget::Within { definition } => definition,
                ResolvedTarget::Subprocess {
                    child_definition, ..
                } => child_definition,
                ResolvedTarget::Parent {
                    parent_definition, ..
                } => parent_definition,
            };
            definition.require_activity(target_activity)?;
        }

        let moves = request
            .moves
            .iter()
            .zip(resolved)
            .zip(source_executions)
            .map(|((spec, target), source_execution)| PlannedMove {
                source_activity_id: spec.source_activity_id().to_string(),
                target_activity_id: spec.target_activity_id().to_string(),
                source_execution_id: source_execution.id,
                kind: match target {
                    ResolvedTarget::Within { definition } => PlannedMoveKind::WithinInstance {
                        refresh_only: spec.source_activity_id() == spec.target_activity_id(),
                        definition,
                    },
                    ResolvedTarget::Subprocess {
                        call_activity_id,
                        child_definition,
                    } => PlannedMoveKind::IntoSubprocess {
                        call_activity_id,
                        child_definition,
                    },
                    ResolvedTarget::Parent {
                        parent_instance_id,
                        parent_execution_id,
                        parent_definition,
                    } => PlannedMoveKind::ToParent {
                        parent_instance_id,
                        parent_execution_id,
                        parent_definition,
                    },
                },
            })
            .collect();

        debug!(
            process_instance_id = request.process_instance_id,
            moves = request.moves.len(),
            "Validated migration request"
        );
        Ok(MigrationPlan {
            process_instance_id: request.process_instance_id.clone(),
            moves,
            variables: request.variables.clone(),
        })
    }
}
