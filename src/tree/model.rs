use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Ended,
}

/// The root of one execution tree: a running occurrence of a process
/// definition. Instances spawned through a call activity carry the id of
/// the super execution, the token in the parent tree whose lifecycle is
/// coupled to this instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: String,
    pub definition_id: String,
    pub definition_key: String,
    pub definition_version: i32,
    pub super_execution_id: Option<String>,
    pub state: InstanceState,
    pub started_at: NaiveDateTime,
}

/// A token: one node in an instance's execution tree. Parents exclusively
/// own their children; deleting a parent cascades. Scope executions never
/// carry a current activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub instance_id: String,
    pub parent_id: Option<String>,
    pub activity_id: Option<String>,
    pub is_scope: bool,
    pub is_concurrent: bool,
    pub created_at: NaiveDateTime,
}

/// A unit of human work bound 1:1 to a leaf execution. Created when a
/// user-task activity is entered, destroyed when the token leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntity {
    pub id: String,
    pub execution_id: String,
    pub instance_id: String,
    pub task_definition_key: String,
    pub created_at: NaiveDateTime,
}
