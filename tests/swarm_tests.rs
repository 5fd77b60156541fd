// Integration tests for swarm construction validation and the
// post_message/start_task entry points.

use async_trait::async_trait;
use mail::{
    ActionExecutor, AgentDescriptor, AgentFn, AgentFnError, AgentOutput, HistoryEntry,
    MailConfig, SwarmError, SystemClock, ToolCallRequest,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Echo(&'static str);

#[async_trait]
impl AgentFn for Echo {
    async fn invoke(&self, _history: &[HistoryEntry]) -> Result<AgentOutput, AgentFnError> {
        Ok(AgentOutput {
            text: Some(self.0.to_string()),
            tool_calls: vec![],
        })
    }
}

struct CompletesImmediately;

#[async_trait]
impl AgentFn for CompletesImmediately {
    async fn invoke(&self, _history: &[HistoryEntry]) -> Result<AgentOutput, AgentFnError> {
        Ok(AgentOutput {
            text: None,
            tool_calls: vec![ToolCallRequest {
                name: "task_complete".to_string(),
                arguments: json!({"finish_message": "handled"}),
            }],
        })
    }
}

fn test_config() -> MailConfig {
    MailConfig {
        local_swarm_name: "alpha".to_string(),
        default_submit_timeout: Duration::from_secs(5),
        ..MailConfig::default()
    }
}

#[test]
fn rejects_reserved_agent_name() {
    let descriptor = AgentDescriptor::new("all", Arc::new(Echo("x")))
        .as_entrypoint()
        .as_supervisor();
    let result = mail::Swarm::new(vec![descriptor], ActionExecutor::new(), test_config(), Arc::new(SystemClock));
    assert!(matches!(result.err(), Some(SwarmError::ReservedAgentName)));
}

#[test]
fn rejects_duplicate_agent_names() {
    let descriptors = vec![
        AgentDescriptor::new("supervisor", Arc::new(Echo("a")))
            .as_entrypoint()
            .as_supervisor(),
        AgentDescriptor::new("supervisor", Arc::new(Echo("b"))),
    ];
    let result = mail::Swarm::new(descriptors, ActionExecutor::new(), test_config(), Arc::new(SystemClock));
    assert!(matches!(result.err(), Some(SwarmError::DuplicateAgentName(name)) if name == "supervisor"));
}

#[test]
fn rejects_missing_entrypoint() {
    let descriptors = vec![AgentDescriptor::new("supervisor", Arc::new(Echo("a"))).as_supervisor()];
    let result = mail::Swarm::new(descriptors, ActionExecutor::new(), test_config(), Arc::new(SystemClock));
    assert!(matches!(result.err(), Some(SwarmError::NoEntrypoint)));
}

#[test]
fn rejects_multiple_entrypoints() {
    let descriptors = vec![
        AgentDescriptor::new("a", Arc::new(Echo("a")))
            .as_entrypoint()
            .as_supervisor(),
        AgentDescriptor::new("b", Arc::new(Echo("b"))).as_entrypoint(),
    ];
    let result = mail::Swarm::new(descriptors, ActionExecutor::new(), test_config(), Arc::new(SystemClock));
    assert!(matches!(result.err(), Some(SwarmError::MultipleEntrypoints { .. })));
}

#[test]
fn rejects_missing_supervisor() {
    let descriptors = vec![AgentDescriptor::new("a", Arc::new(Echo("a"))).as_entrypoint()];
    let result = mail::Swarm::new(descriptors, ActionExecutor::new(), test_config(), Arc::new(SystemClock));
    assert!(matches!(result.err(), Some(SwarmError::NoSupervisor)));
}

#[test]
fn rejects_unknown_comm_target() {
    let descriptors = vec![AgentDescriptor::new("a", Arc::new(Echo("a")))
        .as_entrypoint()
        .as_supervisor()
        .with_comm_targets(["ghost"])];
    let result = mail::Swarm::new(descriptors, ActionExecutor::new(), test_config(), Arc::new(SystemClock));
    assert!(matches!(result.err(), Some(SwarmError::UnknownCommTarget { .. })));
}

#[tokio::test]
async fn post_message_blocks_until_task_complete() {
    let descriptor = AgentDescriptor::new("supervisor", Arc::new(CompletesImmediately))
        .as_entrypoint()
        .as_supervisor();
    let swarm = mail::Swarm::new(vec![descriptor], ActionExecutor::new(), test_config(), Arc::new(SystemClock)).unwrap();

    let result = swarm.post_message("supervisor", "hello").await.unwrap();
    assert_eq!(result, "handled");
    swarm.shutdown().await;
}

#[tokio::test]
async fn start_task_returns_a_task_id_without_blocking() {
    let descriptor = AgentDescriptor::new("supervisor", Arc::new(CompletesImmediately))
        .as_entrypoint()
        .as_supervisor();
    let swarm = mail::Swarm::new(vec![descriptor], ActionExecutor::new(), test_config(), Arc::new(SystemClock)).unwrap();

    let task_id = swarm.start_task("supervisor", "hello");
    // Give the background dispatch loop a moment to process it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = swarm.runtime().events_for(task_id).await;
    assert!(events.iter().any(|e| e.kind == mail::EventKind::TaskComplete));
    swarm.shutdown().await;
}
