//! Agent descriptor and the `AgentFn` interface.
//!
//! spec.md §9 frames an agent as "an interface `AgentFn = (history) -> (text?,
//! [ToolCall])`" without naming a Rust shape; this module supplies one,
//! grounded in the teacher crate's `ClientWrapper` trait (`async_trait`,
//! `Send + Sync`, held behind `Arc<dyn _>`). The runtime never inspects an
//! agent's internals beyond this interface.

use crate::mail::error::AgentFnError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Role of a single history entry, seeding or recording an agent's reasoning
/// context for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRole {
    User,
    Assistant,
    Tool,
    System,
}

/// One entry in an agent's per-task history. The head is seeded by the
/// envelope that woke the agent (rendered as XML via
/// [`Envelope::render_for_agent`](crate::message::Envelope::render_for_agent));
/// subsequent entries record the agent's own tool calls and their results.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: HistoryRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A single tool call requested by an agent's generation.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: Value,
}

/// What an agent function returns for one invocation: optional free text and
/// zero or more tool calls to route through the tool catalog or action
/// executor.
#[derive(Debug, Clone, Default)]
pub struct AgentOutput {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// The opaque agent interface the scheduler drives. Implementations may wrap
/// a real LM backend, a deterministic mock for tests, or a programmable
/// stub — the scheduler never distinguishes between them.
#[async_trait]
pub trait AgentFn: Send + Sync {
    async fn invoke(&self, history: &[HistoryEntry]) -> Result<AgentOutput, AgentFnError>;
}

/// Hint passed to the agent function alongside its history, mirroring the
/// provider-agnostic `tool_format` concept without binding to a concrete
/// vendor schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolFormat {
    #[default]
    Default,
}

/// `{name, comm_targets[], can_complete_tasks, enable_entrypoint, tool_format,
/// fn, actions[]}`.
#[derive(Clone)]
pub struct AgentDescriptor {
    pub name: String,
    /// The sole authority on which recipient names this agent may address
    /// (invariant 3). Does not need to include `"all"` — broadcasting is
    /// always permitted.
    pub comm_targets: Vec<String>,
    /// Supervisors may emit `task_complete`.
    pub can_complete_tasks: bool,
    /// Exactly one agent in a swarm may set this.
    pub enable_entrypoint: bool,
    pub tool_format: ToolFormat,
    pub func: Arc<dyn AgentFn>,
    /// Names of actions (executed via the action executor) this agent may
    /// call, in addition to the built-in MAIL tools.
    pub actions: Vec<String>,
    /// Non-scheduling metadata used only for fixtures/logging context.
    pub priority: i32,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, func: Arc<dyn AgentFn>) -> Self {
        Self {
            name: name.into(),
            comm_targets: Vec::new(),
            can_complete_tasks: false,
            enable_entrypoint: false,
            tool_format: ToolFormat::default(),
            func,
            actions: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_comm_targets(mut self, targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.comm_targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn as_supervisor(mut self) -> Self {
        self.can_complete_tasks = true;
        self
    }

    pub fn as_entrypoint(mut self) -> Self {
        self.enable_entrypoint = true;
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `target` is a legal recipient for this agent (invariant 3).
    /// `all` is always permitted since any agent may broadcast.
    pub fn may_address(&self, target: &str) -> bool {
        target == crate::mail::message::ALL || self.comm_targets.iter().any(|t| t == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl AgentFn for Echo {
        async fn invoke(&self, _history: &[HistoryEntry]) -> Result<AgentOutput, AgentFnError> {
            Ok(AgentOutput {
                text: Some("ok".to_string()),
                tool_calls: vec![],
            })
        }
    }

    #[test]
    fn may_address_respects_comm_targets() {
        let descriptor = AgentDescriptor::new("supervisor", Arc::new(Echo))
            .with_comm_targets(["weather"]);
        assert!(descriptor.may_address("weather"));
        assert!(descriptor.may_address("all"));
        assert!(!descriptor.may_address("finance"));
    }
}
