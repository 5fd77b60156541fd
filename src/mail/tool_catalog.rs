//! Built-in MAIL tools and their conversion to envelopes.
//!
//! Grounded in the teacher crate's `tool_protocol.rs` vocabulary (named tools
//! with a fixed argument shape, validated before execution) but specialised:
//! these ten tools are not dispatched through the generic
//! [`ActionExecutor`](crate::action_executor::ActionExecutor) — they are
//! recognised by name and translated directly into scheduler effects.

use crate::mail::error::ToolCallError;
use crate::mail::agent::ToolCallRequest;
use crate::mail::message::{
    Address, Clock, Envelope, EnvelopeKind, FanoutPayload, RequestPayload, ResponsePayload, ALL,
};
use serde_json::Value;
use uuid::Uuid;

pub const BUILTIN_TOOL_NAMES: &[&str] = &[
    "send_request",
    "send_response",
    "send_interrupt",
    "send_broadcast",
    "task_complete",
    "acknowledge_broadcast",
    "ignore_broadcast",
    "await_message",
    "send_interswarm_broadcast",
    "discover_swarms",
];

pub fn is_builtin_tool(name: &str) -> bool {
    BUILTIN_TOOL_NAMES.contains(&name)
}

/// A parsed, validated invocation of one of the ten built-in tools.
#[derive(Debug, Clone)]
pub enum MailTool {
    SendRequest {
        target: String,
        subject: String,
        body: String,
    },
    SendResponse {
        target: String,
        subject: String,
        body: String,
    },
    SendInterrupt {
        target: String,
        subject: String,
        body: String,
    },
    SendBroadcast {
        subject: String,
        body: String,
    },
    TaskComplete {
        finish_message: String,
    },
    AcknowledgeBroadcast {
        note: Option<String>,
    },
    IgnoreBroadcast {
        reason: Option<String>,
    },
    AwaitMessage {
        reason: Option<String>,
    },
    SendInterswarmBroadcast {
        subject: String,
        body: String,
        target_swarms: Vec<String>,
    },
    DiscoverSwarms {
        discovery_urls: Vec<String>,
    },
}

fn str_field(args: &Value, field: &str) -> Result<String, ToolCallError> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolCallError::InvalidParameters(format!("missing field '{}'", field)))
}

fn opt_str_field(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(Value::as_str).map(str::to_string)
}

fn str_array_field(args: &Value, field: &str) -> Result<Vec<String>, ToolCallError> {
    args.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ToolCallError::InvalidParameters(format!("missing field '{}'", field)))
}

/// Parses a raw tool call into a [`MailTool`], validating argument shapes
/// against the table in the tool catalog specification.
pub fn parse_tool_call(call: &ToolCallRequest) -> Result<MailTool, ToolCallError> {
    match call.name.as_str() {
        "send_request" => Ok(MailTool::SendRequest {
            target: str_field(&call.arguments, "target")?,
            subject: str_field(&call.arguments, "subject")?,
            body: str_field(&call.arguments, "body")?,
        }),
        "send_response" => Ok(MailTool::SendResponse {
            target: str_field(&call.arguments, "target")?,
            subject: str_field(&call.arguments, "subject")?,
            body: str_field(&call.arguments, "body")?,
        }),
        "send_interrupt" => Ok(MailTool::SendInterrupt {
            target: str_field(&call.arguments, "target")?,
            subject: str_field(&call.arguments, "subject")?,
            body: str_field(&call.arguments, "body")?,
        }),
        "send_broadcast" => Ok(MailTool::SendBroadcast {
            subject: str_field(&call.arguments, "subject")?,
            body: str_field(&call.arguments, "body")?,
        }),
        "task_complete" => Ok(MailTool::TaskComplete {
            finish_message: str_field(&call.arguments, "finish_message")?,
        }),
        "acknowledge_broadcast" => Ok(MailTool::AcknowledgeBroadcast {
            note: opt_str_field(&call.arguments, "note"),
        }),
        "ignore_broadcast" => Ok(MailTool::IgnoreBroadcast {
            reason: opt_str_field(&call.arguments, "reason"),
        }),
        "await_message" => Ok(MailTool::AwaitMessage {
            reason: opt_str_field(&call.arguments, "reason"),
        }),
        "send_interswarm_broadcast" => Ok(MailTool::SendInterswarmBroadcast {
            subject: str_field(&call.arguments, "subject")?,
            body: str_field(&call.arguments, "body")?,
            target_swarms: str_array_field(&call.arguments, "target_swarms")?,
        }),
        "discover_swarms" => Ok(MailTool::DiscoverSwarms {
            discovery_urls: str_array_field(&call.arguments, "discovery_urls")?,
        }),
        other => Err(ToolCallError::NotFound(other.to_string())),
    }
}

/// The scheduler-level effect produced by converting a [`MailTool`] call into
/// action. `Enqueue` and `CompleteTask` both carry a ready-to-dispatch
/// envelope; the runtime treats `CompleteTask` specially (resolves the
/// pending future/stream for the task).
#[derive(Debug, Clone)]
pub enum CatalogEffect {
    Enqueue(Envelope),
    CompleteTask(Envelope),
    AwaitMessage,
    AcknowledgeBroadcast(Option<String>),
    IgnoreBroadcast,
    InterswarmBroadcast(Envelope),
    DiscoverSwarms(Vec<String>),
}

/// Validates the call's target against `comm_targets` and constructs the
/// corresponding envelope/effect. `in_reply_to` is the `request_id` of the
/// request this agent is currently replying to, if any (supplied by the
/// scheduler from the envelope that seeded the current dispatch) — used to
/// correlate `send_response` with its originating request.
pub fn call_to_envelope(
    tool: &MailTool,
    sender: &Address,
    comm_targets: &[String],
    in_reply_to: Option<Uuid>,
    task_id: Uuid,
    clock: &dyn Clock,
) -> Result<CatalogEffect, ToolCallError> {
    let check_target = |target: &str| -> Result<(), ToolCallError> {
        if target == ALL || comm_targets.iter().any(|t| t == target) {
            Ok(())
        } else {
            Err(ToolCallError::TargetForbidden {
                caller: sender.name.clone(),
                target: target.to_string(),
            })
        }
    };

    match tool {
        MailTool::SendRequest {
            target,
            subject,
            body,
        } => {
            check_target(target)?;
            let env = Envelope::construct(
                EnvelopeKind::Request(RequestPayload {
                    sender: sender.clone(),
                    recipient: Address::agent(target.clone()),
                    subject: subject.clone(),
                    body: body.clone(),
                    request_id: clock.new_id(),
                }),
                task_id,
                clock,
            )
            .map_err(|e| ToolCallError::InvalidParameters(e.to_string()))?;
            Ok(CatalogEffect::Enqueue(env))
        }
        MailTool::SendResponse {
            target,
            subject,
            body,
        } => {
            check_target(target)?;
            let env = Envelope::construct(
                EnvelopeKind::Response(ResponsePayload {
                    sender: sender.clone(),
                    recipient: Address::agent(target.clone()),
                    subject: subject.clone(),
                    body: body.clone(),
                    request_id: in_reply_to.unwrap_or_else(|| clock.new_id()),
                }),
                task_id,
                clock,
            )
            .map_err(|e| ToolCallError::InvalidParameters(e.to_string()))?;
            Ok(CatalogEffect::Enqueue(env))
        }
        MailTool::SendInterrupt {
            target,
            subject,
            body,
        } => {
            check_target(target)?;
            let env = Envelope::construct(
                EnvelopeKind::Interrupt(FanoutPayload {
                    sender: sender.clone(),
                    recipients: vec![Address::agent(target.clone())],
                    subject: subject.clone(),
                    body: body.clone(),
                    fanout_id: clock.new_id(),
                }),
                task_id,
                clock,
            )
            .map_err(|e| ToolCallError::InvalidParameters(e.to_string()))?;
            Ok(CatalogEffect::Enqueue(env))
        }
        MailTool::SendBroadcast { subject, body } => {
            let env = Envelope::construct(
                EnvelopeKind::Broadcast(FanoutPayload {
                    sender: sender.clone(),
                    recipients: vec![Address::all_agents()],
                    subject: subject.clone(),
                    body: body.clone(),
                    fanout_id: clock.new_id(),
                }),
                task_id,
                clock,
            )
            .map_err(|e| ToolCallError::InvalidParameters(e.to_string()))?;
            Ok(CatalogEffect::Enqueue(env))
        }
        MailTool::TaskComplete { finish_message } => {
            let env = Envelope::construct(
                EnvelopeKind::TaskComplete(FanoutPayload {
                    sender: sender.clone(),
                    recipients: vec![Address::all_agents()],
                    subject: "task complete".to_string(),
                    body: finish_message.clone(),
                    fanout_id: clock.new_id(),
                }),
                task_id,
                clock,
            )
            .map_err(|e| ToolCallError::InvalidParameters(e.to_string()))?;
            Ok(CatalogEffect::CompleteTask(env))
        }
        MailTool::AcknowledgeBroadcast { note } => {
            Ok(CatalogEffect::AcknowledgeBroadcast(note.clone()))
        }
        MailTool::IgnoreBroadcast { .. } => Ok(CatalogEffect::IgnoreBroadcast),
        MailTool::AwaitMessage { .. } => Ok(CatalogEffect::AwaitMessage),
        MailTool::SendInterswarmBroadcast {
            subject,
            body,
            target_swarms,
        } => {
            let recipients = target_swarms
                .iter()
                .map(|swarm| Address::agent(format!("{}@{}", ALL, swarm)))
                .collect();
            let mut env = Envelope::construct(
                EnvelopeKind::Broadcast(FanoutPayload {
                    sender: sender.clone(),
                    recipients,
                    subject: subject.clone(),
                    body: body.clone(),
                    fanout_id: clock.new_id(),
                }),
                task_id,
                clock,
            )
            .map_err(|e| ToolCallError::InvalidParameters(e.to_string()))?;
            env.recipient_swarms = target_swarms.clone();
            Ok(CatalogEffect::InterswarmBroadcast(env))
        }
        MailTool::DiscoverSwarms { discovery_urls } => {
            Ok(CatalogEffect::DiscoverSwarms(discovery_urls.clone()))
        }
    }
}
