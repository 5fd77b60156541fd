// Integration tests for inter-swarm routing: outbound transport failure
// surfacing as a MAIL-level error, and inbound delivery's token check and
// idempotent redelivery.

use async_trait::async_trait;
use mail::{
    ActionExecutor, AgentDescriptor, AgentFn, AgentFnError, AgentOutput, Envelope, EnvelopeKind,
    HistoryEntry, RequestPayload, Address, Router, SwarmRegistry, SystemClock, Runtime,
    ToolCallRequest,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptedAgent {
    seen: Mutex<Vec<String>>,
    steps: Mutex<VecDeque<AgentOutput>>,
}

impl ScriptedAgent {
    fn new(steps: Vec<AgentOutput>) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            steps: Mutex::new(steps.into_iter().collect()),
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentFn for ScriptedAgent {
    async fn invoke(&self, history: &[HistoryEntry]) -> Result<AgentOutput, AgentFnError> {
        if let Some(last) = history.last() {
            self.seen.lock().unwrap().push(last.content.clone());
        }
        Ok(self.steps.lock().unwrap().pop_front().unwrap_or_default())
    }
}

fn set_token(peer: &str, value: &str) {
    let var = format!("SWARM_AUTH_TOKEN_{}", peer.to_uppercase().replace('-', "_"));
    unsafe {
        std::env::set_var(var, value);
    }
}

#[tokio::test]
async fn unreachable_peer_surfaces_a_router_error_response_to_the_sender() {
    set_token("ghost-peer", "shared-secret");

    let supervisor = Arc::new(ScriptedAgent::new(vec![
        AgentOutput {
            text: None,
            tool_calls: vec![ToolCallRequest {
                name: "send_request".to_string(),
                arguments: json!({"target": "someone@ghost-peer", "subject": "q", "body": "ping"}),
            }],
        },
        AgentOutput {
            text: None,
            tool_calls: vec![ToolCallRequest {
                name: "task_complete".to_string(),
                arguments: json!({"finish_message": "saw the error"}),
            }],
        },
    ]));
    let descriptor = AgentDescriptor::new("supervisor", supervisor.clone())
        .as_entrypoint()
        .as_supervisor()
        .with_comm_targets(["someone@ghost-peer"]);
    let runtime = Runtime::new(
        "local",
        vec![descriptor],
        ActionExecutor::new(),
        64,
        Arc::new(SystemClock),
        Duration::from_secs(15),
    )
    .unwrap();

    let registry = Arc::new(SwarmRegistry::new(Duration::from_secs(30), 3));
    // Port 1 is reserved and nothing listens there, so the connect fails fast.
    registry.register("ghost-peer", "http://127.0.0.1:1", false, None, None);
    let router = Arc::new(Router::new(
        "local",
        registry,
        runtime.clone(),
        Duration::from_millis(500),
        16,
    ));
    runtime.attach_router(router);

    let clock = SystemClock;
    let task_id = clock.new_id();
    let seed = Envelope::construct(
        EnvelopeKind::Request(RequestPayload {
            sender: Address::user("user"),
            recipient: Address::agent("supervisor"),
            subject: "kickoff".to_string(),
            body: "start".to_string(),
            request_id: clock.new_id(),
        }),
        task_id,
        &clock,
    )
    .unwrap();

    let result = runtime.submit_and_wait(seed, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "saw the error");

    let seen = supervisor.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].contains("unreachable"), "expected a router_error in history, got: {:?}", seen);
}

#[tokio::test]
async fn handle_inbound_rejects_a_bad_token() {
    set_token("peer-b", "correct-token");

    let supervisor = Arc::new(ScriptedAgent::new(vec![]));
    let descriptor = AgentDescriptor::new("supervisor", supervisor.clone())
        .as_entrypoint()
        .as_supervisor();
    let runtime = Runtime::new(
        "local",
        vec![descriptor],
        ActionExecutor::new(),
        64,
        Arc::new(SystemClock),
        Duration::from_secs(15),
    )
    .unwrap();
    let registry = Arc::new(SwarmRegistry::new(Duration::from_secs(30), 3));
    let router = Router::new("local", registry, runtime.clone(), Duration::from_secs(1), 16);

    let clock = SystemClock;
    let task_id = clock.new_id();
    let envelope = Envelope::construct(
        EnvelopeKind::Request(RequestPayload {
            sender: Address::agent("remote-agent"),
            recipient: Address::agent("supervisor"),
            subject: "q".to_string(),
            body: "hi".to_string(),
            request_id: clock.new_id(),
        }),
        task_id,
        &clock,
    )
    .unwrap();
    let body = serde_json::json!({"message": {
        "message_id": envelope.id,
        "source_swarm": "peer-b",
        "target_swarm": "local",
        "timestamp": chrono::Utc::now(),
        "payload": envelope,
        "task_owner": "supervisor:remote-agent@peer-b",
        "task_contributors": ["supervisor:remote-agent@peer-b"],
    }}).to_string();

    let result = router.handle_inbound("wrong-token", &body).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn handle_inbound_delivers_once_and_ignores_replays() {
    set_token("peer-c", "good-token");

    let supervisor = Arc::new(ScriptedAgent::new(vec![AgentOutput {
        text: None,
        tool_calls: vec![ToolCallRequest {
            name: "task_complete".to_string(),
            arguments: json!({"finish_message": "delivered"}),
        }],
    }]));
    let descriptor = AgentDescriptor::new("supervisor", supervisor.clone())
        .as_entrypoint()
        .as_supervisor();
    let runtime = Runtime::new(
        "local",
        vec![descriptor],
        ActionExecutor::new(),
        64,
        Arc::new(SystemClock),
        Duration::from_secs(15),
    )
    .unwrap();
    let registry = Arc::new(SwarmRegistry::new(Duration::from_secs(30), 3));
    let router = Router::new("local", registry, runtime.clone(), Duration::from_secs(1), 16);

    let clock = SystemClock;
    let task_id = clock.new_id();
    let envelope = Envelope::construct(
        EnvelopeKind::Request(RequestPayload {
            sender: Address::agent("remote-agent"),
            recipient: Address::agent("supervisor"),
            subject: "q".to_string(),
            body: "hi".to_string(),
            request_id: clock.new_id(),
        }),
        task_id,
        &clock,
    )
    .unwrap();
    let body = serde_json::json!({"message": {
        "message_id": envelope.id,
        "source_swarm": "peer-c",
        "target_swarm": "local",
        "timestamp": chrono::Utc::now(),
        "payload": envelope,
        "task_owner": "supervisor:remote-agent@peer-c",
        "task_contributors": ["supervisor:remote-agent@peer-c"],
    }}).to_string();

    router.handle_inbound("good-token", &body).await.unwrap();
    // Same envelope id delivered twice: accepted both times (no error) but
    // only enqueued once.
    router.handle_inbound("good-token", &body).await.unwrap();

    // Give the single delivery a moment to complete the task.
    for _ in 0..50 {
        if supervisor.seen().len() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(supervisor.seen().len(), 1, "replayed delivery should not re-enqueue");
}
