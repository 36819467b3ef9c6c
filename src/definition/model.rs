use crate::core::errors::{ProcessionError, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reference to the process a call activity spawns. Literal references
/// name a definition key directly; expressions are evaluated against the
/// process variables at resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalledElement {
    Literal(String),
    Expression(String),
}

impl CalledElement {
    /// Parse a raw called-element string. Anything containing a `${...}`
    /// placeholder is treated as an expression.
    pub fn parse(raw: &str) -> Self {
        if raw.contains("${") {
            CalledElement::Expression(raw.to_string())
        } else {
            CalledElement::Literal(raw.to_string())
        }
    }

    pub fn as_text(&self) -> &str {
        match self {
            CalledElement::Literal(text) | CalledElement::Expression(text) => text,
        }
    }
}

/// Node kind within a process definition graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Human work; entering the activity creates a task entity
    UserTask,
    /// Automatic step; a token can sit here but no task is created
    ServiceTask,
    /// Spawns a nested process instance when entered
    CallActivity { called_element: CalledElement },
}

/// A single node in the activity graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityNode {
    pub id: String,
    pub name: Option<String>,
    pub kind: ActivityKind,
}

impl ActivityNode {
    pub fn is_call_activity(&self) -> bool {
        matches!(self.kind, ActivityKind::CallActivity { .. })
    }

    /// Whether a token entering this activity creates a task entity
    pub fn creates_task(&self) -> bool {
        matches!(self.kind, ActivityKind::UserTask)
    }

    pub fn called_element(&self) -> Option<&CalledElement> {
        match &self.kind {
            ActivityKind::CallActivity { called_element } => Some(called_element),
            _ => None,
        }
    }
}

/// Versioned, immutable process definition: activity nodes plus sequence
/// flows. Resolved read-only by the engine, never mutated after deploy.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    id: String,
    key: String,
    version: i32,
    graph: DiGraph<ActivityNode, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl ProcessDefinition {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn has_activity(&self, activity_id: &str) -> bool {
        self.indices.contains_key(activity_id)
    }

    pub fn activity(&self, activity_id: &str) -> Option<&ActivityNode> {
        self.indices.get(activity_id).map(|ix| &self.graph[*ix])
    }

    /// Look up an activity, failing with `ActivityNotFound` if absent
    pub fn require_activity(&self, activity_id: &str) -> Result<&ActivityNode> {
        self.activity(activity_id)
            .ok_or_else(|| ProcessionError::activity_not_found(activity_id, &self.id))
    }

    /// Look up a call activity, failing if absent or of a different kind
    pub fn require_call_activity(&self, activity_id: &str) -> Result<&ActivityNode> {
        let node = self.require_activity(activity_id)?;
        if !node.is_call_activity() {
            return Err(ProcessionError::validation_field(
                format!(
                    "activity '{}' in definition '{}' is not a call activity",
                    activity_id, self.id
                ),
                "call_activity_id",
            ));
        }
        Ok(node)
    }

    /// The definition's entry point: the first declared activity without
    /// incoming sequence flows
    pub fn start_activity(&self) -> Option<&ActivityNode> {
        self.graph
            .node_indices()
            .find(|ix| {
                self.graph
                    .neighbors_directed(*ix, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|ix| &self.graph[ix])
    }

    /// Activities directly downstream of the given activity
    pub fn outgoing_activities(&self, activity_id: &str) -> Vec<&ActivityNode> {
        match self.indices.get(activity_id) {
            Some(ix) => self
                .graph
                .neighbors_directed(*ix, Direction::Outgoing)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn activity_ids(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .map(|ix| self.graph[ix].id.clone())
            .collect()
    }

    /// Parse a YAML definition document
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let parsed: DefinitionDoc = serde_yaml::from_str(doc)?;
        parsed.into_definition()
    }
}

/// Fluent constructor for process definitions
pub struct DefinitionBuilder {
    key: String,
    version: i32,
    activities: Vec<ActivityNode>,
    flows: Vec<(String, String)>,
}

impl DefinitionBuilder {
    pub fn new<K: Into<String>>(key: K, version: i32) -> Self {
        Self {
            key: key.into(),
            version,
            activities: Vec::new(),
            flows: Vec::new(),
        }
    }

    pub fn user_task<I: Into<String>>(mut self, id: I) -> Self {
        self.activities.push(ActivityNode {
            id: id.into(),
            name: None,
            kind: ActivityKind::UserTask,
        });
        self
    }

    pub fn service_task<I: Into<String>>(mut self, id: I) -> Self {
        self.activities.push(ActivityNode {
            id: id.into(),
            name: None,
            kind: ActivityKind::ServiceTask,
        });
        self
    }

    pub fn call_activity<I: Into<String>>(mut self, id: I, called_element: &str) -> Self {
        self.activities.push(ActivityNode {
            id: id.into(),
            name: None,
            kind: ActivityKind::CallActivity {
                called_element: CalledElement::parse(called_element),
            },
        });
        self
    }

    pub fn flow<F: Into<String>, T: Into<String>>(mut self, from: F, to: T) -> Self {
        self.flows.push((from.into(), to.into()));
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        if self.key.is_empty() {
            return Err(ProcessionError::validation_field(
                "definition key cannot be empty",
                "key",
            ));
        }
        if self.version < 1 {
            return Err(ProcessionError::validation_field(
                format!("definition version must be positive, got {}", self.version),
                "version",
            ));
        }
        if self.activities.is_empty() {
            return Err(ProcessionError::validation(format!(
                "definition '{}' declares no activities",
                self.key
            )));
        }

        let id = format!("{}:{}", self.key, self.version);
        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();
        for node in self.activities {
            if indices.contains_key(&node.id) {
                return Err(ProcessionError::validation(format!(
                    "duplicate activity id '{}' in definition '{}'",
                    node.id, id
                )));
            }
            let activity_id = node.id.clone();
            let ix = graph.add_node(node);
            indices.insert(activity_id, ix);
        }
        for (from, to) in self.flows {
            let from_ix = *indices.get(&from).ok_or_else(|| {
                ProcessionError::validation(format!(
                    "sequence flow references unknown activity '{}' in definition '{}'",
                    from, id
                ))
            })?;
            let to_ix = *indices.get(&to).ok_or_else(|| {
                ProcessionError::validation(format!(
                    "sequence flow references unknown activity '{}' in definition '{}'",
                    to, id
                ))
            })?;
            graph.add_edge(from_ix, to_ix, ());
        }

        Ok(ProcessDefinition {
            id,
            key: self.key,
            version: self.version,
            graph,
            indices,
        })
    }
}

// YAML document shape, kept separate from the runtime model so the graph
// representation can change without breaking deployed documents.

#[derive(Debug, Deserialize)]
struct DefinitionDoc {
    key: String,
    version: i32,
    activities: Vec<ActivityDoc>,
    #[serde(default)]
    flows: Vec<FlowDoc>,
}

#[derive(Debug, Deserialize)]
struct ActivityDoc {
    id: String,
    #[serde(default)]
    name: Option<String>,
    kind: String,
    #[serde(default)]
    called_element: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlowDoc {
    from: String,
    to: String,
}

impl DefinitionDoc {
    fn into_definition(self) -> Result<ProcessDefinition> {
        let mut builder = DefinitionBuilder::new(self.key, self.version);
        for activity in self.activities {
            let node = ActivityNode {
                id: activity.id.clone(),
                name: activity.name,
                kind: match activity.kind.as_str() {
                    "user_task" => ActivityKind::UserTask,
                    "service_task" => ActivityKind::ServiceTask,
                    "call_activity" => {
                        let raw = activity.called_element.ok_or_else(|| {
                            ProcessionError::validation(format!(
                                "call activity '{}' declares no called_element",
                                activity.id
                            ))
                        })?;
                        ActivityKind::CallActivity {
                            called_element: CalledElement::parse(&raw),
                        }
                    }
                    other => {
                        return Err(ProcessionError::validation(format!(
                            "unknown activity kind '{}' on activity '{}'",
                            other, activity.id
                        )))
                    }
                },
            };
            builder.activities.push(node);
        }
        for flow in self.flows {
            builder.flows.push((flow.from, flow.to));
        }
        builder.build()
    }
}
