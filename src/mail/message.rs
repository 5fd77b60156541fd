//! Envelope model: typed, schema-validated messages and their canonical
//! textual rendering for agent input.
//!
//! `Envelope` is a sum type tagged by `kind` (§9 "tagged variants over
//! inheritance" design note) rather than a class hierarchy. `render_for_agent`
//! is deterministic given identical `id`/`timestamp` so that replayed
//! histories reproduce prompts byte-for-byte.

use crate::mail::error::SchemaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// The reserved recipient name that fans a broadcast/interrupt out to every
/// local agent.
pub const ALL: &str = "all";

/// Address kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    Agent,
    User,
    System,
    Admin,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressKind::Agent => "agent",
            AddressKind::User => "user",
            AddressKind::System => "system",
            AddressKind::Admin => "admin",
        };
        write!(f, "{}", s)
    }
}

/// `{kind, name}`. `name` may be a bare local name or `local@swarm` for
/// remote agents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub kind: AddressKind,
    pub name: String,
}

impl Address {
    pub fn new(kind: AddressKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn agent(name: impl Into<String>) -> Self {
        Self::new(AddressKind::Agent, name)
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(AddressKind::User, name)
    }

    pub fn system(name: impl Into<String>) -> Self {
        Self::new(AddressKind::System, name)
    }

    pub fn admin(name: impl Into<String>) -> Self {
        Self::new(AddressKind::Admin, name)
    }

    /// The reserved fanout address `{agent, all}`.
    pub fn all_agents() -> Self {
        Self::agent(ALL)
    }

    pub fn is_all(&self) -> bool {
        self.kind == AddressKind::Agent && self.name == ALL
    }

    /// Splits a possibly-qualified `local@swarm` name into `(local, swarm)`.
    pub fn split_swarm(&self) -> (&str, Option<&str>) {
        match self.name.split_once('@') {
            Some((local, swarm)) => (local, Some(swarm)),
            None => (self.name.as_str(), None),
        }
    }

    /// True iff this address names a peer swarm other than `local_swarm`.
    pub fn is_remote(&self, local_swarm: &str) -> bool {
        match self.split_swarm().1 {
            Some(swarm) => swarm != local_swarm,
            None => false,
        }
    }

    /// Bare local name, stripping any `@swarm` suffix.
    pub fn local_name(&self) -> &str {
        self.split_swarm().0
    }

    /// Returns a copy of this address with `@swarm` appended to the name.
    pub fn qualified(&self, swarm: &str) -> Address {
        Address::new(self.kind, format!("{}@{}", self.local_name(), swarm))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub sender: Address,
    pub recipient: Address,
    pub subject: String,
    pub body: String,
    pub request_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub sender: Address,
    pub recipient: Address,
    pub subject: String,
    pub body: String,
    pub request_id: Uuid,
}

/// Shared shape for `broadcast`, `interrupt`, and `task_complete` — all three
/// carry `recipients[>=1]` rather than a single recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutPayload {
    pub sender: Address,
    pub recipients: Vec<Address>,
    pub subject: String,
    pub body: String,
    pub fanout_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request(RequestPayload),
    Response(ResponsePayload),
    Broadcast(FanoutPayload),
    Interrupt(FanoutPayload),
    TaskComplete(FanoutPayload),
}

impl EnvelopeKind {
    pub fn label(&self) -> &'static str {
        match self {
            EnvelopeKind::Request(_) => "request",
            EnvelopeKind::Response(_) => "response",
            EnvelopeKind::Broadcast(_) => "broadcast",
            EnvelopeKind::Interrupt(_) => "interrupt",
            EnvelopeKind::TaskComplete(_) => "task_complete",
        }
    }

    pub fn sender(&self) -> &Address {
        match self {
            EnvelopeKind::Request(p) => &p.sender,
            EnvelopeKind::Response(p) => &p.sender,
            EnvelopeKind::Broadcast(p) => &p.sender,
            EnvelopeKind::Interrupt(p) => &p.sender,
            EnvelopeKind::TaskComplete(p) => &p.sender,
        }
    }

    /// All recipients addressed by this envelope (one for request/response,
    /// many for the fanout kinds).
    pub fn recipients(&self) -> Vec<&Address> {
        match self {
            EnvelopeKind::Request(p) => vec![&p.recipient],
            EnvelopeKind::Response(p) => vec![&p.recipient],
            EnvelopeKind::Broadcast(p) => p.recipients.iter().collect(),
            EnvelopeKind::Interrupt(p) => p.recipients.iter().collect(),
            EnvelopeKind::TaskComplete(p) => p.recipients.iter().collect(),
        }
    }

    pub fn subject(&self) -> &str {
        match self {
            EnvelopeKind::Request(p) => &p.subject,
            EnvelopeKind::Response(p) => &p.subject,
            EnvelopeKind::Broadcast(p) => &p.subject,
            EnvelopeKind::Interrupt(p) => &p.subject,
            EnvelopeKind::TaskComplete(p) => &p.subject,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            EnvelopeKind::Request(p) => &p.body,
            EnvelopeKind::Response(p) => &p.body,
            EnvelopeKind::Broadcast(p) => &p.body,
            EnvelopeKind::Interrupt(p) => &p.body,
            EnvelopeKind::TaskComplete(p) => &p.body,
        }
    }
}

/// A validated, immutable unit of communication — the currency of the
/// scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub task_id: Uuid,
    pub kind: EnvelopeKind,
    /// Set only by the router when forwarding across swarms.
    pub sender_swarm: Option<String>,
    pub recipient_swarms: Vec<String>,
    pub routing_info: HashMap<String, String>,
}

/// Injectable source of `Uuid`s and timestamps so `construct` is testable
/// without faking global time, per the design note against hidden singletons.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// `Clock` backed by the real wall clock and random UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// System-originated subjects are wrapped in double-colon markers so they
/// are visually distinct from agent-authored subjects.
pub fn system_marker(name: &str) -> String {
    format!("::{}::", name)
}

impl Envelope {
    /// Assigns `id`/`timestamp` and validates required fields for `kind`.
    pub fn construct(kind: EnvelopeKind, task_id: Uuid, clock: &dyn Clock) -> Result<Self, SchemaError> {
        validate_kind(&kind)?;
        Ok(Self {
            id: clock.new_id(),
            timestamp: clock.now(),
            task_id,
            kind,
            sender_swarm: None,
            recipient_swarms: Vec::new(),
            routing_info: HashMap::new(),
        })
    }

    /// Convenience constructor for system-issued error responses
    /// (`::tool_call_error::`, `::router_error::`, `::agent_error::`, ...).
    pub fn system_response(
        marker: &str,
        recipient: Address,
        body: impl Into<String>,
        task_id: Uuid,
        clock: &dyn Clock,
    ) -> Self {
        let request_id = clock.new_id();
        Self::construct(
            EnvelopeKind::Response(ResponsePayload {
                sender: Address::system("mail"),
                recipient,
                subject: system_marker(marker),
                body: body.into(),
                request_id,
            }),
            task_id,
            clock,
        )
        .expect("system_response always satisfies the response schema")
    }

    /// Deterministic XML-like rendering used as agent input. Multi-recipient
    /// kinds emit one `<to>` element per recipient.
    pub fn render_for_agent(&self) -> String {
        let mut out = String::new();
        out.push_str("<message>\n");
        out.push_str(&format!("  <timestamp>{}</timestamp>\n", self.timestamp.to_rfc3339()));
        let sender = self.kind.sender();
        out.push_str(&format!(
            "  <from kind=\"{}\">{}</from>\n",
            sender.kind, sender.name
        ));
        for recipient in self.kind.recipients() {
            out.push_str(&format!(
                "  <to kind=\"{}\">{}</to>\n",
                recipient.kind, recipient.name
            ));
        }
        out.push_str(&format!("  <subject>{}</subject>\n", self.kind.subject()));
        out.push_str(&format!("  <body>{}</body>\n", self.kind.body()));
        out.push_str("</message>");
        out
    }
}

fn validate_kind(kind: &EnvelopeKind) -> Result<(), SchemaError> {
    match kind {
        EnvelopeKind::Request(p) => {
            if p.subject.is_empty() {
                return Err(SchemaError::MissingField("subject".to_string()));
            }
            Ok(())
        }
        EnvelopeKind::Response(p) => {
            if p.subject.is_empty() {
                return Err(SchemaError::MissingField("subject".to_string()));
            }
            Ok(())
        }
        EnvelopeKind::Broadcast(p) | EnvelopeKind::Interrupt(p) => {
            if p.recipients.is_empty() {
                return Err(SchemaError::EmptyRecipients);
            }
            Ok(())
        }
        EnvelopeKind::TaskComplete(p) => {
            if p.recipients.is_empty() {
                return Err(SchemaError::EmptyRecipients);
            }
            if p.recipients.len() != 1 || !p.recipients[0].is_all() {
                return Err(SchemaError::TaskCompleteRecipientsMustBeAll);
            }
            Ok(())
        }
    }
}
