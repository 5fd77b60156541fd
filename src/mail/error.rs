//! Error taxonomy for the MAIL runtime.
//!
//! Each error kind corresponds to one of the failure modes named in the
//! wire/runtime specification. They are plain enums with hand-rolled
//! `Display`/`Error` impls, matching the style `cloudllm`'s `ToolError`
//! established rather than reaching for a derive macro crate.

use std::fmt;

/// An envelope failed schema validation at `construct()` or at ingress.
#[derive(Debug, Clone)]
pub enum SchemaError {
    /// A required field for the envelope's kind was missing or empty.
    MissingField(String),
    /// A multi-recipient kind (`broadcast`, `interrupt`, `task_complete`) was
    /// constructed with an empty recipient list.
    EmptyRecipients,
    /// `task_complete` was constructed with recipients other than `[all]`.
    TaskCompleteRecipientsMustBeAll,
    /// An agent was declared with the reserved name `all`.
    ReservedAgentName,
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::MissingField(field) => write!(f, "missing required field: {}", field),
            SchemaError::EmptyRecipients => write!(f, "recipient list must not be empty"),
            SchemaError::TaskCompleteRecipientsMustBeAll => {
                write!(f, "task_complete recipients must be [all]")
            }
            SchemaError::ReservedAgentName => {
                write!(f, "agent name 'all' is reserved for fanout")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

/// A tool call (built-in or action) failed validation or routing.
#[derive(Debug, Clone)]
pub enum ToolCallError {
    /// The recipient named in the call is outside the caller's `comm_targets`.
    TargetForbidden { caller: String, target: String },
    /// The call's arguments did not match the tool/action's parameter schema.
    InvalidParameters(String),
    /// The named tool or action does not exist.
    NotFound(String),
}

impl fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCallError::TargetForbidden { caller, target } => write!(
                f,
                "{} is not allowed to address {} (outside comm_targets)",
                caller, target
            ),
            ToolCallError::InvalidParameters(msg) => write!(f, "invalid parameters: {}", msg),
            ToolCallError::NotFound(name) => write!(f, "tool not found: {}", name),
        }
    }
}

impl std::error::Error for ToolCallError {}

/// A third-party action raised or returned an invalid shape.
#[derive(Debug, Clone)]
pub enum ActionError {
    NotFound(String),
    InvalidParameters(String),
    ExecutionFailed(String),
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::NotFound(name) => write!(f, "action not found: {}", name),
            ActionError::InvalidParameters(msg) => write!(f, "invalid parameters: {}", msg),
            ActionError::ExecutionFailed(msg) => write!(f, "action execution failed: {}", msg),
        }
    }
}

impl std::error::Error for ActionError {}

/// An agent function raised instead of returning a result.
#[derive(Debug, Clone)]
pub struct AgentFnError(pub String);

impl fmt::Display for AgentFnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent function error: {}", self.0)
    }
}

impl std::error::Error for AgentFnError {}

/// Inter-swarm transport or credential failure.
#[derive(Debug, Clone)]
pub enum RouterError {
    UnreachablePeer { swarm: String, reason: String },
    NonSuccessStatus { swarm: String, status: u16 },
    MissingAuthToken { env_var: String },
    UnknownPeer(String),
    UnknownTaskOwner { task_id: String },
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::UnreachablePeer { swarm, reason } => {
                write!(f, "peer swarm '{}' unreachable: {}", swarm, reason)
            }
            RouterError::NonSuccessStatus { swarm, status } => write!(
                f,
                "peer swarm '{}' returned non-success status {}",
                swarm, status
            ),
            RouterError::MissingAuthToken { env_var } => write!(
                f,
                "auth token environment variable '{}' is not set",
                env_var
            ),
            RouterError::UnknownPeer(name) => write!(f, "unknown peer swarm: {}", name),
            RouterError::UnknownTaskOwner { task_id } => {
                write!(f, "received response for unknown task_id: {}", task_id)
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// Terminal or scheduler-level failures.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// `submit_and_wait`/`submit_and_stream` exceeded its wall-clock bound.
    TaskTimeout,
    /// The task was cancelled via `cancel()`.
    Cancelled,
    /// An unhandled exception occurred inside the dispatch loop.
    RuntimeFault(String),
    /// The runtime has been shut down and no longer accepts submissions.
    ShuttingDown,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::TaskTimeout => write!(f, "task timed out"),
            RuntimeError::Cancelled => write!(f, "task was cancelled"),
            RuntimeError::RuntimeFault(msg) => write!(f, "runtime error: {}", msg),
            RuntimeError::ShuttingDown => write!(f, "runtime is shutting down"),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Errors surfaced by swarm container instantiation/validation.
#[derive(Debug, Clone)]
pub enum SwarmError {
    UnknownCommTarget { agent: String, target: String },
    NoEntrypoint,
    MultipleEntrypoints { first: String, second: String },
    NoSupervisor,
    ReservedAgentName,
    DuplicateAgentName(String),
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmError::UnknownCommTarget { agent, target } => write!(
                f,
                "agent '{}' declares comm_target '{}' which is not present in the swarm",
                agent, target
            ),
            SwarmError::NoEntrypoint => write!(f, "no agent has enable_entrypoint = true"),
            SwarmError::MultipleEntrypoints { first, second } => write!(
                f,
                "multiple entrypoints declared: '{}' and '{}'",
                first, second
            ),
            SwarmError::NoSupervisor => {
                write!(f, "no agent has can_complete_tasks = true")
            }
            SwarmError::ReservedAgentName => {
                write!(f, "agent name 'all' is reserved for fanout")
            }
            SwarmError::DuplicateAgentName(name) => {
                write!(f, "duplicate agent name: {}", name)
            }
        }
    }
}

impl std::error::Error for SwarmError {}
