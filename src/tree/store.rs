use crate::core::errors::{ProcessionError, Result};
use crate::definition::model::ProcessDefinition;
use crate::tree::model::{Execution, InstanceState, ProcessInstance, TaskEntity};
use chrono::{NaiveDateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// A freshly created process instance together with the executions and
/// task seeded into it.
#[derive(Debug, Clone)]
pub struct StartedInstance {
    pub instance: ProcessInstance,
    pub scope_execution: Execution,
    pub initial_execution: Execution,
    pub initial_task: Option<TaskEntity>,
}

/// Records removed by a cascading execution delete
#[derive(Debug, Default, Clone)]
pub struct DeletedSubtree {
    pub executions: Vec<Execution>,
    pub tasks: Vec<TaskEntity>,
}

/// Records removed by terminating an instance and its nested children
#[derive(Debug, Default, Clone)]
pub struct TerminatedHierarchy {
    pub instances: Vec<ProcessInstance>,
    pub executions: Vec<Execution>,
    pub tasks: Vec<TaskEntity>,
}

/// Point-in-time copy of every record in one call hierarchy, used for
/// all-or-nothing command application.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub root_instance_id: String,
    instances: Vec<ProcessInstance>,
    executions: Vec<Execution>,
    tasks: Vec<TaskEntity>,
    variables: Vec<(String, HashMap<String, Value>)>,
}

impl TreeSnapshot {
    /// Scope ids (instances and tasks) captured in this snapshot
    pub fn scope_ids(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|i| i.id.clone())
            .chain(self.tasks.iter().map(|t| t.id.clone()))
            .collect()
    }
}

/// Live store of execution trees: an arena of instances, executions and
/// tasks addressed by stable ids. All cross-references (super execution,
/// parent execution) are id-indexed weak references resolved through
/// lookup, never owning pointers.
#[derive(Debug, Default)]
pub struct ExecutionTreeStore {
    instances: DashMap<String, ProcessInstance>,
    executions: DashMap<String, Execution>,
    executions_by_instance: DashMap<String, DashSet<String>>,
    children_by_parent: DashMap<String, DashSet<String>>,
    tasks: DashMap<String, TaskEntity>,
    tasks_by_execution: DashMap<String, String>,
    tasks_by_instance: DashMap<String, DashSet<String>>,
    variables: DashMap<String, HashMap<String, Value>>,
    hierarchy_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExecutionTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- instance lifecycle ----

    /// Create a process instance rooted with a scope execution and one
    /// leaf execution at the start activity. A task entity is created
    /// when the start activity is task-backed.
    pub fn create_process_instance(
        &self,
        definition: &ProcessDefinition,
        start_activity_id: &str,
        super_execution_id: Option<String>,
        variables: HashMap<String, Value>,
    ) -> Result<StartedInstance> {
        let start_activity = definition.require_activity(start_activity_id)?;
        if let Some(super_id) = &super_execution_id {
            if !self.executions.contains_key(super_id) {
                return Err(ProcessionError::validation(format!(
                    "super execution '{}' does not exist",
                    super_id
                )));
            }
        }

        let instance = ProcessInstance {
            id: cuid2::create_id(),
            definition_id: definition.id().to_string(),
            definition_key: definition.key().to_string(),
            definition_version: definition.version(),
            super_execution_id,
            state: InstanceState::Active,
            started_at: now(),
        };
        self.instances.insert(instance.id.clone(), instance.clone());
        self.variables.insert(instance.id.clone(), variables);

        let scope_execution = self.create_execution(&instance.id, None, None, true, false)?;
        let initial_execution = self.create_execution(
            &instance.id,
            Some(scope_execution.id.clone()),
            Some(start_activity_id.to_string()),
            false,
            false,
        )?;
        let initial_task = if start_activity.creates_task() {
            Some(self.create_task(&initial_execution, start_activity_id)?)
        } else {
            None
        };

        debug!(
            instance_id = instance.id,
            definition_id = instance.definition_id,
            start_activity = start_activity_id,
            "Created process instance"
        );
        Ok(StartedInstance {
            instance,
            scope_execution,
            initial_execution,
            initial_task,
        })
    }

    /// Terminate an instance in full: all executions, tasks, variables
    /// and nested child instances cascade. Returns everything removed so
    /// links and history can be synchronized.
    pub fn terminate_process_instance(&self, instance_id: &str) -> Result<TerminatedHierarchy> {
        if !self.instances.contains_key(instance_id) {
            return Err(ProcessionError::validation(format!(
                "process instance '{}' does not exist",
                instance_id
            )));
        }

        let mut removed = TerminatedHierarchy::default();
        // Children go before their parents so removal order mirrors the
        // end-event order the executor emits.
        let mut ordered = self.hierarchy_instance_ids(instance_id);
        ordered.reverse();

        for id in ordered {
            for execution in self.executions_for_instance(&id) {
                if let Some(task) = self.delete_task_for_execution(&execution.id) {
                    removed.tasks.push(task);
                }
                self.remove_execution_record(&execution.id);
                removed.executions.push(execution);
            }
            self.executions_by_instance.remove(&id);
            self.variables.remove(&id);
            self.tasks_by_instance.remove(&id);
            if let Some((_, mut instance)) = self.instances.remove(&id) {
                instance.state = InstanceState::Ended;
                removed.instances.push(instance);
            }
        }

        debug!(
            instance_id,
            instances = removed.instances.len(),
            executions = removed.executions.len(),
            tasks = removed.tasks.len(),
            "Terminated process instance hierarchy"
        );
        Ok(removed)
    }

    pub fn instance(&self, instance_id: &str) -> Option<ProcessInstance> {
        self.instances.get(instance_id).map(|e| e.clone())
    }

    pub fn require_instance(&self, instance_id: &str) -> Result<ProcessInstance> {
        self.instance(instance_id).ok_or_else(|| {
            ProcessionError::validation(format!(
                "process instance '{}' does not exist",
                instance_id
            ))
        })
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    // ---- execution primitives ----

    pub fn create_execution(
        &self,
        instance_id: &str,
        parent_id: Option<String>,
        activity_id: Option<String>,
        is_scope: bool,
        is_concurrent: bool,
    ) -> Result<Execution> {
        if is_scope && activity_id.is_some() {
            return Err(ProcessionError::validation(
                "scope executions cannot carry a current activity",
            ));
        }
        if let Some(parent) = &parent_id {
            if !self.executions.contains_key(parent) {
                return Err(ProcessionError::validation(format!(
                    "parent execution '{}' does not exist",
                    parent
                )));
            }
        }

        let execution = Execution {
            id: cuid2::create_id(),
            instance_id: instance_id.to_string(),
            parent_id,
            activity_id,
            is_scope,
            is_concurrent,
            created_at: now(),
        };
        self.executions
            .insert(execution.id.clone(), execution.clone());
        self.executions_by_instance
            .entry(instance_id.to_string())
            .or_default()
            .insert(execution.id.clone());
        if let Some(parent) = &execution.parent_id {
            self.children_by_parent
                .entry(parent.clone())
                .or_default()
                .insert(execution.id.clone());
        }
        Ok(execution)
    }

    /// Delete an execution and everything it owns: child executions
    /// recurse, bound tasks go with their executions.
    pub fn delete_execution(&self, execution_id: &str) -> Result<DeletedSubtree> {
        if !self.executions.contains_key(execution_id) {
            return Err(ProcessionError::validation(format!(
                "execution '{}' does not exist",
                execution_id
            )));
        }

        let mut removed = DeletedSubtree::default();
        let mut stack = vec![execution_id.to_string()];
        let mut ordered = Vec::new();
        while let Some(id) = stack.pop() {
            for child in self.child_executions(&id) {
                stack.push(child.id);
            }
            ordered.push(id);
        }
        // Leaves first
        for id in ordered.into_iter().rev() {
            if let Some(task) = self.delete_task_for_execution(&id) {
                removed.tasks.push(task);
            }
            if let Some(execution) = self.remove_execution_record(&id) {
                removed.executions.push(execution);
            }
        }
        Ok(removed)
    }

    fn remove_execution_record(&self, execution_id: &str) -> Option<Execution> {
        let (_, execution) = self.executions.remove(execution_id)?;
        if let Some(set) = self.executions_by_instance.get(&execution.instance_id) {
            set.remove(execution_id);
        }
        if let Some(parent) = &execution.parent_id {
            if let Some(set) = self.children_by_parent.get(parent) {
                set.remove(execution_id);
            }
        }
        self.children_by_parent.remove(execution_id);
        Some(execution)
    }

    /// Re-point an execution at a different activity (or none)
    pub fn update_execution_activity(
        &self,
        execution_id: &str,
        activity_id: Option<String>,
    ) -> Result<Execution> {
        let mut entry = self.executions.get_mut(execution_id).ok_or_else(|| {
            ProcessionError::validation(format!("execution '{}' does not exist", execution_id))
        })?;
        if entry.is_scope && activity_id.is_some() {
            return Err(ProcessionError::validation(
                "scope executions cannot carry a current activity",
            ));
        }
        entry.activity_id = activity_id;
        Ok(entry.clone())
    }

    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.executions.get(execution_id).map(|e| e.clone())
    }

    pub fn require_execution(&self, execution_id: &str) -> Result<Execution> {
        self.execution(execution_id).ok_or_else(|| {
            ProcessionError::validation(format!("execution '{}' does not exist", execution_id))
        })
    }

    pub fn executions_for_instance(&self, instance_id: &str) -> Vec<Execution> {
        match self.executions_by_instance.get(instance_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.execution(id.key()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn child_executions(&self, parent_execution_id: &str) -> Vec<Execution> {
        match self.children_by_parent.get(parent_execution_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.execution(id.key()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Leaf executions of an instance: non-scope executions without
    /// children, the engine's picture of concurrently active tokens.
    /// Optionally filtered to one activity.
    pub fn leaf_executions(&self, instance_id: &str, activity_id: Option<&str>) -> Vec<Execution> {
        self.executions_for_instance(instance_id)
            .into_iter()
            .filter(|e| !e.is_scope)
            .filter(|e| {
                self.children_by_parent
                    .get(&e.id)
                    .map_or(true, |set| set.is_empty())
            })
            .filter(|e| match activity_id {
                Some(activity) => e.activity_id.as_deref() == Some(activity),
                None => true,
            })
            .collect()
    }

    // ---- tasks ----

    pub fn create_task(
        &self,
        execution: &Execution,
        task_definition_key: &str,
    ) -> Result<TaskEntity> {
        if self.tasks_by_execution.contains_key(&execution.id) {
            return Err(ProcessionError::validation(format!(
                "execution '{}' already has a task",
                execution.id
            )));
        }
        let task = TaskEntity {
            id: cuid2::create_id(),
            execution_id: execution.id.clone(),
            instance_id: execution.instance_id.clone(),
            task_definition_key: task_definition_key.to_string(),
            created_at: now(),
        };
        self.tasks.insert(task.id.clone(), task.clone());
        self.tasks_by_execution
            .insert(execution.id.clone(), task.id.clone());
        self.tasks_by_instance
            .entry(execution.instance_id.clone())
            .or_default()
            .insert(task.id.clone());
        Ok(task)
    }

    pub fn delete_task_for_execution(&self, execution_id: &str) -> Option<TaskEntity> {
        let (_, task_id) = self.tasks_by_execution.remove(execution_id)?;
        let (_, task) = self.tasks.remove(&task_id)?;
        if let Some(set) = self.tasks_by_instance.get(&task.instance_id) {
            set.remove(&task_id);
        }
        Some(task)
    }

    pub fn task_for_execution(&self, execution_id: &str) -> Option<TaskEntity> {
        self.tasks_by_execution
            .get(execution_id)
            .and_then(|id| self.tasks.get(id.value()).map(|t| t.clone()))
    }

    pub fn tasks_for_instance(&self, instance_id: &str) -> Vec<TaskEntity> {
        match self.tasks_by_instance.get(instance_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.tasks.get(id.key()).map(|t| t.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks whose execution currently sits at the given activity
    pub fn tasks_at_activity(&self, instance_id: &str, activity_id: &str) -> Vec<TaskEntity> {
        self.tasks_for_instance(instance_id)
            .into_iter()
            .filter(|t| {
                self.execution(&t.execution_id)
                    .map_or(false, |e| e.activity_id.as_deref() == Some(activity_id))
            })
            .collect()
    }

    // ---- variables ----

    pub fn variables(&self, instance_id: &str) -> HashMap<String, Value> {
        self.variables
            .get(instance_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn set_variable(&self, instance_id: &str, name: &str, value: Value) {
        self.variables
            .entry(instance_id.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    // ---- hierarchy navigation ----

    /// The instance owning the super execution of the given instance
    pub fn super_instance_of(&self, instance_id: &str) -> Option<String> {
        let instance = self.instance(instance_id)?;
        let super_execution = self.execution(&instance.super_execution_id?)?;
        Some(super_execution.instance_id)
    }

    /// Walk super-execution references up to the top-level instance
    pub fn root_instance_of(&self, instance_id: &str) -> String {
        let mut current = instance_id.to_string();
        while let Some(parent) = self.super_instance_of(&current) {
            current = parent;
        }
        current
    }

    /// Instances spawned by (and coupled to) the given execution
    pub fn instances_by_super_execution(&self, execution_id: &str) -> Vec<ProcessInstance> {
        self.instances
            .iter()
            .filter(|entry| entry.super_execution_id.as_deref() == Some(execution_id))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Instances whose super execution lives in the given instance
    pub fn instances_by_super_instance(&self, parent_instance_id: &str) -> Vec<ProcessInstance> {
        self.instances
            .iter()
            .filter(|entry| {
                entry
                    .super_execution_id
                    .as_ref()
                    .and_then(|id| self.execution(id))
                    .map_or(false, |e| e.instance_id == parent_instance_id)
            })
            .map(|entry| entry.clone())
            .collect()
    }

    /// All instance ids of the hierarchy under (and including) the given
    /// instance, parents before children
    pub fn hierarchy_instance_ids(&self, top_instance_id: &str) -> Vec<String> {
        let mut ordered = Vec::new();
        let mut queue = vec![top_instance_id.to_string()];
        while let Some(id) = queue.pop() {
            for child in self.instances_by_super_instance(&id) {
                queue.push(child.id);
            }
            ordered.push(id);
        }
        ordered
    }

    // ---- transactional support ----

    /// Per-root-hierarchy command lock; commands on disjoint hierarchies
    /// proceed concurrently.
    pub fn hierarchy_lock(&self, root_instance_id: &str) -> Arc<Mutex<()>> {
        self.hierarchy_locks
            .entry(root_instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Copy every record of the hierarchy rooted at the given instance
    pub fn snapshot_hierarchy(&self, root_instance_id: &str) -> TreeSnapshot {
        let members = self.hierarchy_instance_ids(root_instance_id);
        let mut snapshot = TreeSnapshot {
            root_instance_id: root_instance_id.to_string(),
            instances: Vec::new(),
            executions: Vec::new(),
            tasks: Vec::new(),
            variables: Vec::new(),
        };
        for id in members {
            if let Some(instance) = self.instance(&id) {
                snapshot.instances.push(instance);
            }
            snapshot.executions.extend(self.executions_for_instance(&id));
            snapshot.tasks.extend(self.tasks_for_instance(&id));
            snapshot.variables.push((id.clone(), self.variables(&id)));
        }
        snapshot
    }

    /// Put a hierarchy back exactly as it was snapshotted, discarding any
    /// records created in it since.
    pub fn restore_hierarchy(&self, snapshot: &TreeSnapshot) {
        warn!(
            root_instance_id = snapshot.root_instance_id,
            "Restoring hierarchy snapshot after failed command"
        );
        for id in self.hierarchy_instance_ids(&snapshot.root_instance_id) {
            for execution in self.executions_for_instance(&id) {
                self.delete_task_for_execution(&execution.id);
                self.remove_execution_record(&execution.id);
            }
            self.executions_by_instance.remove(&id);
            self.tasks_by_instance.remove(&id);
            self.variables.remove(&id);
            self.instances.remove(&id);
        }

        for instance in &snapshot.instances {
            self.instances.insert(instance.id.clone(), instance.clone());
        }
        for execution in &snapshot.executions {
            self.executions
                .insert(execution.id.clone(), execution.clone());
            self.executions_by_instance
                .entry(execution.instance_id.clone())
                .or_default()
                .insert(execution.id.clone());
            if let Some(parent) = &execution.parent_id {
                self.children_by_parent
                    .entry(parent.clone())
                    .or_default()
                    .insert(execution.id.clone());
            }
        }
        for task in &snapshot.tasks {
            self.tasks.insert(task.id.clone(), task.clone());
            self.tasks_by_execution
                .insert(task.execution_id.clone(), task.id.clone());
            self.tasks_by_instance
                .entry(task.instance_id.clone())
                .or_default()
                .insert(task.id.clone());
        }
        for (instance_id, variables) in &snapshot.variables {
            self.variables.insert(instance_id.clone(), variables.clone());
        }
    }
}
