// src/lib.rs

pub mod mail;

pub use mail::action_executor::{Action, ActionExecutor, ActionParameter, ActionParamType};
pub use mail::agent::{AgentDescriptor, AgentFn, AgentOutput, HistoryEntry, HistoryRole, ToolCallRequest, ToolFormat};
pub use mail::config::MailConfig;
pub use mail::error::{ActionError, AgentFnError, RouterError, RuntimeError, SchemaError, SwarmError, ToolCallError};
pub use mail::event::{EventKind, EventRecord, EventRing};
pub use mail::message::{
    Address, AddressKind, Clock, Envelope, EnvelopeKind, FanoutPayload, RequestPayload,
    ResponsePayload, SystemClock, ALL,
};
pub use mail::registry::{SwarmEntry, SwarmRegistry};
pub use mail::router::Router;
pub use mail::runtime::{EventStream, ResumeExtras, ResumeKind, Runtime, TaskStatus};
pub use mail::swarm::Swarm;
