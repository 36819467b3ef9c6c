//! Engine façade: owns the subsystems and runs the change-state command
//! as one logical transaction per call hierarchy.

use crate::core::config::EngineConfig;
use crate::core::errors::{ProcessionError, Result};
use crate::definition::catalog::DefinitionCatalog;
use crate::definition::resolver::{CallActivityResolver, EvalexprEvaluator, ExpressionEvaluator};
use crate::history::events::LifecycleEvent;
use crate::history::notifier::{HistoryNotifier, HistoryStore, HistoryWorker};
use crate::links::{HierarchyLinkSynchronizer, LinkTable};
use crate::migration::executor::{MigrationExecutor, MigrationResult};
use crate::migration::planner::MigrationPlanner;
use crate::migration::request::MigrationRequest;
use crate::tree::model::ProcessInstance;
use crate::tree::store::ExecutionTreeStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The runtime core: execution trees, definition catalog, hierarchy
/// links and the asynchronous history pipeline behind one surface.
///
/// Requires a tokio runtime at construction; the history worker is
/// spawned immediately and drains on its own schedule.
pub struct ProcessEngine {
    config: EngineConfig,
    store: Arc<ExecutionTreeStore>,
    catalog: Arc<DefinitionCatalog>,
    link_table: Arc<LinkTable>,
    synchronizer: Arc<HierarchyLinkSynchronizer>,
    notifier: Arc<HistoryNotifier>,
    history: Arc<HistoryStore>,
    planner: MigrationPlanner,
    executor: MigrationExecutor,
    _worker: JoinHandle<()>,
}

impl ProcessEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_evaluator(config, Arc::new(EvalexprEvaluator::new()))
    }

    pub fn with_evaluator(
        config: EngineConfig,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ExecutionTreeStore::new());
        let catalog = Arc::new(DefinitionCatalog::new());
        let link_table = Arc::new(LinkTable::new());
        let synchronizer = Arc::new(HierarchyLinkSynchronizer::new(link_table.clone()));
        let notifier = Arc::new(HistoryNotifier::new(
            config.history_queue_capacity,
            config.history_poll_interval,
        ));
        let history = Arc::new(HistoryStore::new());
        let worker = HistoryWorker::spawn(&notifier, history.clone(), None);

        let resolver = CallActivityResolver::new(catalog.clone(), evaluator);
        let planner = MigrationPlanner::new(store.clone(), catalog.clone(), resolver);
        let executor = MigrationExecutor::new(
            store.clone(),
            synchronizer.clone(),
            config.strict_consistency_check,
        );

        Ok(Self {
            config,
            store,
            catalog,
            link_table,
            synchronizer,
            notifier,
            history,
            planner,
            executor,
            _worker: worker,
        })
    }

    pub fn catalog(&self) -> &Arc<DefinitionCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<ExecutionTreeStore> {
        &self.store
    }

    pub fn link_table(&self) -> &Arc<LinkTable> {
        &self.link_table
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn notifier(&self) -> &Arc<HistoryNotifier> {
        &self.notifier
    }

    /// Start an instance of the latest deployed version of a definition
    pub async fn start_process_instance(
        &self,
        definition_key: &str,
        variables: HashMap<String, Value>,
    ) -> Result<ProcessInstance> {
        let definition = self.catalog.require_latest(definition_key)?;
        let start = definition.start_activity().ok_or_else(|| {
            ProcessionError::validation(format!(
                "definition '{}' has no start activity",
                definition.id()
            ))
        })?;
        let start_id = start.id.clone();

        let started =
            self.store
                .create_process_instance(&definition, &start_id, None, variables)?;
        if let Some(task) = &started.initial_task {
            self.synchronizer.task_created(task);
        }

        self.publish(LifecycleEvent::ProcessInstanceStarted {
            instance_id: started.instance.id.clone(),
            definition_id: definition.id().to_string(),
            super_instance_id: None,
        })
        .await;
        self.publish(LifecycleEvent::ExecutionCreated {
            instance_id: started.instance.id.clone(),
            execution_id: started.scope_execution.id.clone(),
            activity_id: None,
        })
        .await;
        self.publish(LifecycleEvent::ExecutionCreated {
            instance_id: started.instance.id.clone(),
            execution_id: started.initial_execution.id.clone(),
            activity_id: started.initial_execution.activity_id.clone(),
        })
        .await;

        info!(
            instance_id = started.instance.id,
            definition_id = definition.id(),
            "Started process instance"
        );
        Ok(started.instance)
    }

    /// Execute one change-state command: validate the whole batch, then
    /// apply it atomically under the hierarchy lock. Validation failures
    /// return before any mutation; application failures restore the
    /// pre-command snapshot before surfacing.
    pub async fn change_state(&self, request: MigrationRequest) -> Result<MigrationResult> {
        let mut roots = vec![self.store.root_instance_of(&request.process_instance_id)];
        roots.sort();
        roots.dedup();

        // Locks acquired in sorted order; disjoint hierarchies are free
        // to migrate concurrently.
        let mut guards = Vec::with_capacity(roots.len());
        for root in &roots {
            let lock = self.store.hierarchy_lock(root);
            let guard = match self.config.lock_timeout {
                Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                    .await
                    .map_err(|_| {
                        ProcessionError::concurrency_timeout(
                            "acquiring hierarchy lock",
                            timeout.as_millis() as u64,
                        )
                    })?,
                None => lock.lock_owned().await,
            };
            guards.push(guard);
        }

        let plan = match self.planner.plan(&request) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(
                    process_instance_id = request.process_instance_id,
                    category = e.category(),
                    "Migration request rejected: {}",
                    e
                );
                return Err(e);
            }
        };

        let tree_snapshots: Vec<_> = roots
            .iter()
            .map(|root| self.store.snapshot_hierarchy(root))
            .collect();
        let snapshot_scopes: Vec<String> = tree_snapshots
            .iter()
            .flat_map(|s| s.scope_ids())
            .collect();
        let link_snapshot = self.link_table.snapshot_scopes(&snapshot_scopes);

        match self.executor.apply(&plan) {
            Ok(applied) => {
                drop(guards);
                for event in applied.events {
                    self.publish(event).await;
                }
                Ok(applied.result)
            }
            Err(e) => {
                error!(
                    process_instance_id = request.process_instance_id,
                    "Migration failed during application, rolling back: {}",
                    e
                );
                let current_scopes = self.current_scopes(&roots);
                for snapshot in &tree_snapshots {
                    self.store.restore_hierarchy(snapshot);
                }
                self.link_table
                    .restore_scopes(&current_scopes, link_snapshot);
                Err(e)
            }
        }
    }

    /// Block (bounded) until the history worker has applied everything
    /// emitted so far. History is otherwise only eventually consistent.
    pub async fn wait_for_history(&self, timeout: Duration) -> Result<()> {
        self.notifier.wait_until_drained(timeout).await
    }

    /// Close the event queue; the worker stops once the backlog drains
    pub fn close(&self) {
        self.notifier.close();
    }

    async fn publish(&self, event: LifecycleEvent) {
        if let Err(e) = self.notifier.emit(event).await {
            warn!("Dropped lifecycle event: {}", e);
        }
    }

    /// Every scope id (instances and their tasks) currently present in
    /// the given hierarchies
    fn current_scopes(&self, roots: &[String]) -> Vec<String> {
        let mut scopes = Vec::new();
        for root in roots {
            for instance_id in self.store.hierarchy_instance_ids(root) {
                for task in self.store.tasks_for_instance(&instance_id) {
                    scopes.push(task.id);
                }
                scopes.push(instance_id);
            }
        }
        scopes
    }
}
