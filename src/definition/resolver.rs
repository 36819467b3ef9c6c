use crate::core::errors::{ProcessionError, Result};
use crate::definition::catalog::DefinitionCatalog;
use crate::definition::model::{ActivityNode, CalledElement, ProcessDefinition};
use evalexpr::{ContextWithMutableVariables, HashMapContext};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Pluggable expression evaluation capability. The engine only needs this
/// single method; any expression language can sit behind it.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, variables: &HashMap<String, Value>) -> Result<Value>;
}

/// Default evaluator backed by `evalexpr`, handling `${...}` wrapped
/// expressions against the process variable bag.
#[derive(Debug, Default)]
pub struct EvalexprEvaluator;

impl EvalexprEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn unwrap_placeholder(expression: &str) -> &str {
        let trimmed = expression.trim();
        match trimmed.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            Some(inner) => inner.trim(),
            None => trimmed,
        }
    }

    fn to_evalexpr(value: &Value) -> Option<evalexpr::Value> {
        match value {
            Value::Null => Some(evalexpr::Value::Empty),
            Value::Bool(b) => Some(evalexpr::Value::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::String(s) => Some(evalexpr::Value::String(s.clone())),
            // Arrays and objects have no evalexpr counterpart
            _ => None,
        }
    }

    fn from_evalexpr(value: evalexpr::Value) -> Value {
        match value {
            evalexpr::Value::String(s) => Value::String(s),
            evalexpr::Value::Int(i) => Value::from(i),
            evalexpr::Value::Float(f) => Value::from(f),
            evalexpr::Value::Boolean(b) => Value::Bool(b),
            evalexpr::Value::Empty => Value::Null,
            other => Value::String(other.to_string()),
        }
    }
}

impl ExpressionEvaluator for EvalexprEvaluator {
    fn evaluate(&self, expression: &str, variables: &HashMap<String, Value>) -> Result<Value> {
        let inner = Self::unwrap_placeholder(expression);
        if inner.is_empty() {
            return Err(ProcessionError::validation("expression is empty"));
        }

        let mut context = HashMapContext::new();
        for (name, value) in variables {
            if let Some(converted) = Self::to_evalexpr(value) {
                context
                    .set_value(name.clone(), converted)
                    .map_err(|e| ProcessionError::validation(e.to_string()))?;
            }
        }

        let result = evalexpr::eval_with_context(inner, &context)
            .map_err(|e| ProcessionError::validation(e.to_string()))?;
        debug!(expression = inner, "Evaluated called-element expression");
        Ok(Self::from_evalexpr(result))
    }
}

/// Resolves a call activity's called-element reference to a concrete
/// process definition. Pure read/validate; never mutates anything.
pub struct CallActivityResolver {
    catalog: Arc<DefinitionCatalog>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl CallActivityResolver {
    pub fn new(catalog: Arc<DefinitionCatalog>, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { catalog, evaluator }
    }

    /// Resolve the definition a call activity spawns. Literal keys go to
    /// the latest deployed version unless a version is pinned;
    /// expressions are evaluated against the supplied variables first
    /// and must produce a string definition key.
    pub fn resolve(
        &self,
        call_activity: &ActivityNode,
        pinned_version: Option<i32>,
        variables: &HashMap<String, Value>,
    ) -> Result<Arc<ProcessDefinition>> {
        let called = call_activity.called_element().ok_or_else(|| {
            ProcessionError::validation(format!(
                "activity '{}' is not a call activity",
                call_activity.id
            ))
        })?;

        let key = match called {
            CalledElement::Literal(key) => key.clone(),
            CalledElement::Expression(text) => {
                let value = self
                    .evaluator
                    .evaluate(text, variables)
                    .map_err(|e| {
                        ProcessionError::expression_resolution(
                            text.clone(),
                            call_activity.id.clone(),
                            e.to_string(),
                        )
                    })?;
                match value {
                    Value::String(key) => key,
                    other => {
                        return Err(ProcessionError::expression_resolution(
                            text.clone(),
                            call_activity.id.clone(),
                            format!("expected a string definition key, got {}", other),
                        ))
                    }
                }
            }
        };

        match pinned_version {
            Some(version) => self.catalog.require_version(&key, version),
            None => self.catalog.require_latest(&key),
        }
    }
}
