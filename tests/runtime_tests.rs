// Integration tests for the scheduler: a priority-queued dispatch loop
// driving scripted mock agents, the same shape as the teacher's
// multi_participant_tests.rs (mock implementors of the async trait, plain
// #[tokio::test] functions).

use async_trait::async_trait;
use mail::{
    Action, ActionError, ActionExecutor, ActionParamType, ActionParameter, Address,
    AgentDescriptor, AgentFn, AgentFnError, AgentOutput, Clock, Envelope, EnvelopeKind,
    EventKind, HistoryEntry, RequestPayload, ResumeExtras, ResumeKind, Runtime, SystemClock,
    ToolCallRequest,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct ScriptStep {
    delay: Option<Duration>,
    output: AgentOutput,
}

impl ScriptStep {
    fn text(body: &str) -> Self {
        Self {
            delay: None,
            output: AgentOutput {
                text: Some(body.to_string()),
                tool_calls: vec![],
            },
        }
    }

    fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self {
            delay: None,
            output: AgentOutput {
                text: None,
                tool_calls: vec![ToolCallRequest {
                    name: name.to_string(),
                    arguments,
                }],
            },
        }
    }

    fn delayed(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }
}

/// Pops one scripted output per `invoke` call and records the last
/// history entry it saw, so a test can assert both what the agent was
/// told and what it was told in what order.
struct ScriptedAgent {
    seen: Mutex<Vec<String>>,
    steps: Mutex<VecDeque<ScriptStep>>,
}

impl ScriptedAgent {
    fn new(steps: Vec<ScriptStep>) -> Self {
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
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(step) => {
                if let Some(d) = step.delay {
                    tokio::time::sleep(d).await;
                }
                Ok(step.output)
            }
            None => Ok(AgentOutput::default()),
        }
    }
}

fn seed_request(recipient: &str, body: &str, task_id: uuid::Uuid, clock: &SystemClock) -> Envelope {
    Envelope::construct(
        EnvelopeKind::Request(RequestPayload {
            sender: Address::user("user"),
            recipient: Address::agent(recipient.to_string()),
            subject: "kickoff".to_string(),
            body: body.to_string(),
            request_id: clock.new_id(),
        }),
        task_id,
        clock,
    )
    .unwrap()
}

#[tokio::test]
async fn request_response_completes_task() {
    let supervisor = Arc::new(ScriptedAgent::new(vec![ScriptStep::tool_call(
        "task_complete",
        json!({"finish_message": "42"}),
    )]));
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

    let clock = SystemClock;
    let task_id = clock.new_id();
    let env = seed_request("supervisor", "what is the answer", task_id, &clock);

    let result = runtime
        .submit_and_wait(env, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "42");
    assert_eq!(supervisor.seen().len(), 1);
}

#[tokio::test]
async fn higher_tier_preempts_lower_tier_for_the_same_busy_task() {
    let supervisor = Arc::new(ScriptedAgent::new(vec![
        ScriptStep::text("ack-seed").delayed(Duration::from_millis(120)),
        ScriptStep::text("ack-mid"),
        ScriptStep::tool_call("task_complete", json!({"finish_message": "done"})),
    ]));
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

    let clock = SystemClock;
    let task_id = clock.new_id();
    let seed = seed_request("supervisor", "start", task_id, &clock);

    let runtime_for_wait = runtime.clone();
    let handle = tokio::spawn(async move {
        runtime_for_wait
            .submit_and_wait(seed, Duration::from_secs(5))
            .await
    });

    // Give the seed invocation time to start (and start sleeping) before
    // racing two competing envelopes in behind it.
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Submitted first, but agent-sender traffic (tier 5) ranks below
    // system-sender traffic (tier 1) — the system message must be seen
    // by the agent first regardless of arrival order.
    let agent_env = Envelope::construct(
        EnvelopeKind::Request(RequestPayload {
            sender: Address::agent("other-agent"),
            recipient: Address::agent("supervisor"),
            subject: "routine".to_string(),
            body: "AGENT-ROUTINE".to_string(),
            request_id: clock.new_id(),
        }),
        task_id,
        &clock,
    )
    .unwrap();
    runtime.submit(agent_env);

    let sys_env = Envelope::construct(
        EnvelopeKind::Request(RequestPayload {
            sender: Address::system("sysmon"),
            recipient: Address::agent("supervisor"),
            subject: "urgent".to_string(),
            body: "SYS-URGENT".to_string(),
            request_id: clock.new_id(),
        }),
        task_id,
        &clock,
    )
    .unwrap();
    runtime.submit(sys_env);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result, "done");

    let seen = supervisor.seen();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].contains("start"));
    assert!(seen[1].contains("SYS-URGENT"), "system message should be dispatched first: {:?}", seen);
    assert!(seen[2].contains("AGENT-ROUTINE"));
}

#[tokio::test]
async fn broadcast_excludes_sender_and_reaches_every_other_agent() {
    let supervisor = Arc::new(ScriptedAgent::new(vec![
        ScriptStep::tool_call(
            "send_broadcast",
            json!({"subject": "fyi", "body": "starting work"}),
        ),
        ScriptStep::tool_call("task_complete", json!({"finish_message": "done"})),
    ]));
    let worker_a = Arc::new(ScriptedAgent::new(vec![ScriptStep::text("noted")]));
    let worker_b = Arc::new(ScriptedAgent::new(vec![ScriptStep::text("noted")]));

    let descriptors = vec![
        AgentDescriptor::new("supervisor", supervisor.clone())
            .as_entrypoint()
            .as_supervisor()
            .with_comm_targets(["worker-a", "worker-b"]),
        AgentDescriptor::new("worker-a", worker_a.clone()),
        AgentDescriptor::new("worker-b", worker_b.clone()),
    ];
    let runtime = Runtime::new("local", descriptors, ActionExecutor::new(), 64, Arc::new(SystemClock), Duration::from_secs(15)).unwrap();

    let clock = SystemClock;
    let task_id = clock.new_id();
    let env = seed_request("supervisor", "kick off", task_id, &clock);
    let result = runtime.submit_and_wait(env, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "done");

    // Neither worker is the sender, so both receive the broadcast; the
    // supervisor itself never gets its own broadcast echoed back.
    assert_eq!(worker_a.seen().len(), 1);
    assert_eq!(worker_b.seen().len(), 1);
    assert!(worker_a.seen()[0].contains("starting work"));
    assert_eq!(supervisor.seen().len(), 2);
    assert!(!supervisor.seen()[1].contains("starting work"));
}

#[tokio::test]
async fn forbidden_target_surfaces_as_tool_call_error_in_the_callers_own_history() {
    let supervisor = Arc::new(ScriptedAgent::new(vec![
        ScriptStep::tool_call(
            "send_request",
            json!({"target": "finance", "subject": "q", "body": "send numbers"}),
        ),
        ScriptStep::tool_call("task_complete", json!({"finish_message": "blocked"})),
    ]));
    let descriptor = AgentDescriptor::new("supervisor", supervisor.clone())
        .as_entrypoint()
        .as_supervisor()
        .with_comm_targets(["weather"]);
    let runtime = Runtime::new("local", vec![descriptor], ActionExecutor::new(), 64, Arc::new(SystemClock), Duration::from_secs(15)).unwrap();

    let clock = SystemClock;
    let task_id = clock.new_id();
    let env = seed_request("supervisor", "start", task_id, &clock);
    let result = runtime.submit_and_wait(env, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "blocked");

    let seen = supervisor.seen();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].contains("not allowed to address"));
}

struct ApprovalGate;

#[async_trait]
impl Action for ApprovalGate {
    fn name(&self) -> &str {
        "request_approval"
    }

    fn parameters(&self) -> &[ActionParameter] {
        static PARAMS: once_cell::sync::Lazy<Vec<ActionParameter>> =
            once_cell::sync::Lazy::new(|| vec![ActionParameter::new("reason", ActionParamType::String, true)]);
        &PARAMS
    }

    fn is_breakpoint(&self) -> bool {
        true
    }

    async fn call(&self, _arguments: serde_json::Value) -> Result<serde_json::Value, ActionError> {
        unreachable!("breakpoint actions are stashed, never executed")
    }
}

#[tokio::test]
async fn breakpoint_pauses_the_task_until_resumed() {
    let supervisor = Arc::new(ScriptedAgent::new(vec![
        ScriptStep::tool_call("request_approval", json!({"reason": "need sign-off"})),
        ScriptStep::tool_call("task_complete", json!({"finish_message": "approved and done"})),
    ]));
    let descriptor = AgentDescriptor::new("supervisor", supervisor.clone())
        .as_entrypoint()
        .as_supervisor()
        .with_actions(["request_approval"]);
    let mut actions = ActionExecutor::new();
    actions.register(Arc::new(ApprovalGate));
    let runtime = Runtime::new("local", vec![descriptor], actions, 64, Arc::new(SystemClock), Duration::from_secs(15)).unwrap();

    let clock = SystemClock;
    let task_id = clock.new_id();
    let env = seed_request("supervisor", "start", task_id, &clock);

    let runtime_for_wait = runtime.clone();
    let handle = tokio::spawn(async move {
        runtime_for_wait
            .submit_and_wait(env, Duration::from_secs(5))
            .await
    });

    // Wait for the breakpoint to land.
    let mut paused = false;
    for _ in 0..50 {
        let events = runtime.events_for(task_id).await;
        if events.iter().any(|e| e.kind == EventKind::BreakpointToolCall) {
            paused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(paused, "breakpoint event never appeared");

    runtime
        .resume(
            task_id,
            ResumeKind::BreakpointToolCall,
            None,
            ResumeExtras {
                breakpoint_tool_call_result: Some(json!({"approved": true}).to_string()),
            },
        )
        .await
        .unwrap();

    // Nothing re-dispatches the agent on its own after a resume with no
    // queued continuation; nudge it so it can act on the approval.
    let nudge = Envelope::construct(
        EnvelopeKind::Request(RequestPayload {
            sender: Address::system("mail"),
            recipient: Address::agent("supervisor"),
            subject: "::continue::".to_string(),
            body: String::new(),
            request_id: clock.new_id(),
        }),
        task_id,
        &clock,
    )
    .unwrap();
    runtime.submit(nudge);

    let result = handle.await.unwrap().unwrap();
    assert_eq!(result, "approved and done");
}

#[tokio::test]
async fn submit_and_wait_times_out_when_no_one_completes_the_task() {
    let supervisor = Arc::new(ScriptedAgent::new(vec![ScriptStep::text("thinking...")]));
    let descriptor = AgentDescriptor::new("supervisor", supervisor.clone())
        .as_entrypoint()
        .as_supervisor();
    let runtime = Runtime::new("local", vec![descriptor], ActionExecutor::new(), 64, Arc::new(SystemClock), Duration::from_secs(15)).unwrap();

    let clock = SystemClock;
    let task_id = clock.new_id();
    let env = seed_request("supervisor", "start", task_id, &clock);
    let result = runtime.submit_and_wait(env, Duration::from_millis(50)).await;
    assert!(matches!(result, Err(mail::RuntimeError::TaskTimeout)));
}
