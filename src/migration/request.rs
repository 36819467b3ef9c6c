use crate::core::errors::{ProcessionError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One requested token relocation. Source and target name activities;
/// the instance they apply to comes from the surrounding request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveSpec {
    /// Relocate a token to another activity of the same instance
    WithinInstance {
        source_activity_id: String,
        target_activity_id: String,
    },
    /// Terminate the token and start a child instance at the target
    /// activity of the definition the call activity references
    IntoSubprocess {
        source_activity_id: String,
        target_activity_id: String,
        call_activity_id: String,
        definition_version: Option<i32>,
    },
    /// Terminate the whole child instance and resume the parent's
    /// call-activity token at the target activity
    ToParent {
        source_activity_id: String,
        target_activity_id: String,
    },
}

impl MoveSpec {
    pub fn source_activity_id(&self) -> &str {
        match self {
            Self::WithinInstance {
                source_activity_id, ..
            }
            | Self::IntoSubprocess {
                source_activity_id, ..
            }
            | Self::ToParent {
                source_activity_id, ..
            } => source_activity_id,
        }
    }

    pub fn target_activity_id(&self) -> &str {
        match self {
            Self::WithinInstance {
                target_activity_id, ..
            }
            | Self::IntoSubprocess {
                target_activity_id, ..
            }
            | Self::ToParent {
                target_activity_id, ..
            } => target_activity_id,
        }
    }
}

/// An immutable change-state request: ordered move specs plus a variable
/// bag, built by any means. Lives only for one command invocation.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub process_instance_id: String,
    pub moves: Vec<MoveSpec>,
    pub variables: HashMap<String, Value>,
}

impl MigrationRequest {
    /// Start building a request against the instance that currently
    /// holds the source tokens.
    pub fn for_instance<I: Into<String>>(process_instance_id: I) -> MigrationRequestBuilder {
        MigrationRequestBuilder {
            process_instance_id: process_instance_id.into(),
            moves: Vec::new(),
            variables: HashMap::new(),
        }
    }
}

/// Fluent constructor for migration requests
#[derive(Debug, Clone)]
pub struct MigrationRequestBuilder {
    process_instance_id: String,
    moves: Vec<MoveSpec>,
    variables: HashMap<String, Value>,
}

impl MigrationRequestBuilder {
    /// Move the token at `source` to `target` within the same instance
    pub fn move_activity<S: Into<String>, T: Into<String>>(mut self, source: S, target: T) -> Self {
        self.moves.push(MoveSpec::WithinInstance {
            source_activity_id: source.into(),
            target_activity_id: target.into(),
        });
        self
    }

    /// Move the token at `source` into a new child instance at `target`,
    /// spawned through `call_activity` (latest deployed version)
    pub fn move_to_subprocess<S, T, C>(mut self, source: S, target: T, call_activity: C) -> Self
    where
        S: Into<String>,
        T: Into<String>,
        C: Into<String>,
    {
        self.moves.push(MoveSpec::IntoSubprocess {
            source_activity_id: source.into(),
            target_activity_id: target.into(),
            call_activity_id: call_activity.into(),
            definition_version: None,
        });
        self
    }

    /// Same as [`move_to_subprocess`](Self::move_to_subprocess) but pins
    /// the called definition to an explicit version
    pub fn move_to_subprocess_version<S, T, C>(
        mut self,
        source: S,
        target: T,
        call_activity: C,
        definition_version: i32,
    ) -> Self
    where
        S: Into<String>,
        T: Into<String>,
        C: Into<String>,
    {
        self.moves.push(MoveSpec::IntoSubprocess {
            source_activity_id: source.into(),
            target_activity_id: target.into(),
            call_activity_id: call_activity.into(),
            definition_version: Some(definition_version),
        });
        self
    }

    /// Terminate this instance and resume the parent at `target`
    pub fn move_to_parent<S: Into<String>, T: Into<String>>(mut self, source: S, target: T) -> Self {
        self.moves.push(MoveSpec::ToParent {
            source_activity_id: source.into(),
            target_activity_id: target.into(),
        });
        self
    }

    /// Supply one variable for expression evaluation; carried forward as
    /// initial variables of instances spawned by this request
    pub fn variable<N: Into<String>, V: Into<Value>>(mut self, name: N, value: V) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Merge a whole variable bag
    pub fn variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn build(self) -> Result<MigrationRequest> {
        if self.process_instance_id.is_empty() {
            return Err(ProcessionError::validation_field(
                "process instance id cannot be empty",
                "process_instance_id",
            ));
        }
        if self.moves.is_empty() {
            return Err(ProcessionError::validation(
                "a migration request needs at least one move",
            ));
        }
        Ok(MigrationRequest {
            process_instance_id: self.process_instance_id,
            moves: self.moves,
            variables: self.variables,
        })
    }
}
