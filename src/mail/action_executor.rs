//! Execution of non-MAIL (third-party) tool calls declared in an agent's
//! `actions` list.
//!
//! Grounded in the teacher crate's `ToolProtocol` trait / `ToolRegistry`
//! aggregator split (`tool_protocol.rs`): one trait describing the execution
//! contract, one map-backed registry that owns named instances and routes by
//! name.

use crate::mail::error::ActionError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone)]
pub struct ActionParameter {
    pub name: String,
    pub param_type: ActionParamType,
    pub required: bool,
}

impl ActionParameter {
    pub fn new(name: impl Into<String>, param_type: ActionParamType, required: bool) -> Self {
        Self {
            name: name.into(),
            param_type,
            required,
        }
    }
}

/// A non-MAIL tool an agent may call via the action executor.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    fn parameters(&self) -> &[ActionParameter] {
        &[]
    }

    /// Breakpoint actions are never executed by the runtime; see
    /// [`ActionExecutor::is_breakpoint`].
    fn is_breakpoint(&self) -> bool {
        false
    }

    async fn call(&self, arguments: Value) -> Result<Value, ActionError>;
}

/// Validates `arguments` against `action`'s declared parameter schema,
/// reporting the offending path on mismatch.
pub fn validate_arguments(action: &dyn Action, arguments: &Value) -> Result<(), ActionError> {
    let obj = arguments
        .as_object()
        .ok_or_else(|| ActionError::InvalidParameters("arguments must be a JSON object".to_string()))?;

    for param in action.parameters() {
        match obj.get(&param.name) {
            None => {
                if param.required {
                    return Err(ActionError::InvalidParameters(format!(
                        "{}: missing required parameter",
                        param.name
                    )));
                }
            }
            Some(value) => {
                let matches = match param.param_type {
                    ActionParamType::String => value.is_string(),
                    ActionParamType::Number => value.is_number(),
                    ActionParamType::Integer => value.is_i64() || value.is_u64(),
                    ActionParamType::Boolean => value.is_boolean(),
                    ActionParamType::Array => value.is_array(),
                    ActionParamType::Object => value.is_object(),
                };
                if !matches {
                    return Err(ActionError::InvalidParameters(format!(
                        "{}: expected {:?}, got {}",
                        param.name, param.param_type, value
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Registry of named [`Action`]s available to the runtime's dispatch loop.
#[derive(Default, Clone)]
pub struct ActionExecutor {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn is_breakpoint(&self, name: &str) -> bool {
        self.actions.get(name).map(|a| a.is_breakpoint()).unwrap_or(false)
    }

    /// Validates arguments and runs the named action. Non-breakpoint actions
    /// only — callers must check [`is_breakpoint`](Self::is_breakpoint)
    /// first and stash instead of calling this for breakpoint actions.
    pub async fn execute(&self, name: &str, arguments: Value) -> Result<Value, ActionError> {
        let action = self
            .get(name)
            .ok_or_else(|| ActionError::NotFound(name.to_string()))?;
        validate_arguments(action.as_ref(), &arguments)?;
        action.call(arguments).await
    }
}
