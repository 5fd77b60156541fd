//! The runtime scheduler — core of the core.
//!
//! A priority queue drives a single dispatch loop per swarm instance. The
//! loop owns every piece of mutable state (queue, histories, task records)
//! directly; no mutex guards it, matching spec.md §4.4's "single-threaded
//! cooperative... no locks required" framing. External callers talk to the
//! loop through an `mpsc` command channel — the same actor shape spec.md §9
//! asks for when it says to replace a shared global with "an explicit
//! `Router` value injected into each `Runtime`".
//!
//! Concurrency across tasks comes from spawning each agent/action invocation
//! into a `tokio::task::JoinSet` rather than awaiting it inline; the loop
//! keeps dispatching other tasks' envelopes while those invocations run, and
//! folds their results back in as they complete — mirroring the teacher's
//! `Orchestration::run` loop (spawn-then-await-all) generalized to a
//! continuously running scheduler instead of a fixed number of rounds.

use crate::mail::action_executor::ActionExecutor;
use crate::mail::agent::{AgentDescriptor, AgentOutput, HistoryEntry, HistoryRole, ToolCallRequest};
use crate::mail::error::{AgentFnError, RuntimeError};
use crate::mail::event::{EventKind, EventRecord, EventRing};
use crate::mail::message::{
    Address, AddressKind, Clock, Envelope, EnvelopeKind, FanoutPayload,
};
use crate::mail::registry::SwarmRegistry;
use crate::mail::router::Router;
use crate::mail::tool_catalog::{call_to_envelope, is_builtin_tool, parse_tool_call, CatalogEffect};
use serde_json::{json, Value};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Resumption mode for `resume()`, matching spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    UserResponse,
    BreakpointToolCall,
}

/// Extra fields required by `resume(task_id, BreakpointToolCall, ...)`.
#[derive(Debug, Clone, Default)]
pub struct ResumeExtras {
    /// JSON-encoded string; may decode to one object or an array of objects
    /// for multiple parallel breakpoints. The calling agent is recovered from
    /// the stashed breakpoint record, not supplied here.
    pub breakpoint_tool_call_result: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Paused,
    Completed,
    Errored,
}

fn tier_of(env: &Envelope) -> u8 {
    match env.kind.sender().kind {
        AddressKind::System => 1,
        AddressKind::Admin | AddressKind::User => 2,
        AddressKind::Agent => match env.kind {
            EnvelopeKind::Interrupt(_) => 3,
            EnvelopeKind::Broadcast(_) | EnvelopeKind::TaskComplete(_) => 4,
            EnvelopeKind::Request(_) | EnvelopeKind::Response(_) => 5,
        },
    }
}

fn owner_role(kind: AddressKind) -> &'static str {
    match kind {
        AddressKind::User => "user",
        AddressKind::Admin => "admin",
        AddressKind::System | AddressKind::Agent => "swarm",
    }
}

/// Extracts the `swarm` segment out of a `role:id@swarm` task-owner/
/// contributor string.
pub(crate) fn owner_swarm(owner: &str) -> &str {
    owner.rsplit('@').next().unwrap_or("")
}

#[derive(Clone)]
struct QueueEntry {
    envelope: Envelope,
    tier: u8,
    seq: u64,
}

impl QueueEntry {
    fn sort_key(&self) -> (u8, chrono::DateTime<chrono::Utc>, Uuid) {
        (self.tier, self.envelope.timestamp, self.envelope.id)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so a std BinaryHeap (a max-heap) pops the smallest
        // (tier, timestamp, id) tuple first, i.e. the highest-priority entry.
        other.sort_key().cmp(&self.sort_key())
    }
}

struct BreakpointStash {
    queued: Vec<QueueEntry>,
    caller: String,
}

struct TaskRecord {
    owner: String,
    contributors: std::collections::HashSet<String>,
    status: TaskStatus,
    ring: EventRing,
    tx: broadcast::Sender<EventRecord>,
    pending: Option<oneshot::Sender<Result<String, RuntimeError>>>,
    /// One entry per outstanding breakpoint action call; a single agent turn
    /// can hit several before the turn's tool-call loop unwinds, and each
    /// resolves independently via its own recorded `caller`.
    breakpoint_stash: Vec<BreakpointStash>,
    completed_once: bool,
    /// Set once an `EventStream` has been handed out for this task, so a
    /// second `submit_and_stream` on the same task doesn't arm a duplicate
    /// ping loop.
    has_stream: bool,
}

enum InvocationOutcome {
    Agent {
        task_id: Uuid,
        agent_name: String,
        in_reply_to: Option<Uuid>,
        result: Result<AgentOutput, AgentFnError>,
    },
    Action {
        task_id: Uuid,
        caller: Address,
        call: ToolCallRequest,
        result: Result<Value, crate::mail::error::ActionError>,
    },
    Noop,
}

enum Command {
    Submit(Envelope),
    SubmitAndWait {
        env: Envelope,
        timeout: Duration,
        reply: oneshot::Sender<Result<String, RuntimeError>>,
    },
    SubmitAndStream {
        env: Envelope,
        timeout: Duration,
        reply: oneshot::Sender<EventStream>,
    },
    Resume {
        task_id: Uuid,
        kind: ResumeKind,
        body: Option<String>,
        extras: ResumeExtras,
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
    Cancel(Uuid),
    TimeoutFired(Uuid),
    PingTick(Uuid),
    InterswarmResponse(Envelope),
    SetRouter(Arc<Router>),
    SetRegistry(Arc<SwarmRegistry>),
    PendingRequests(oneshot::Sender<Vec<Uuid>>),
    EventsFor {
        task_id: Uuid,
        reply: oneshot::Sender<Vec<EventRecord>>,
    },
    HasTask {
        task_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    /// Records (or merges) a task's owner/contributors ahead of enqueueing
    /// an inbound interswarm payload for it, so `complete_task` knows where
    /// to forward completion even for a task this swarm never originated.
    SeedTaskOwnership {
        task_id: Uuid,
        owner: String,
        contributors: Vec<String>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

/// A live or replayed view of a task's event log, returned by
/// `submit_and_stream`. Closes after yielding a terminal (`task_complete` or
/// `task_error`) event.
pub struct EventStream {
    backlog: VecDeque<EventRecord>,
    live: Option<broadcast::Receiver<EventRecord>>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<EventRecord> {
        if let Some(ev) = self.backlog.pop_front() {
            return Some(ev);
        }
        let live = self.live.as_mut()?;
        match live.recv().await {
            Ok(ev) => {
                if matches!(ev.kind, EventKind::TaskComplete | EventKind::TaskError) {
                    self.live = None;
                }
                Some(ev)
            }
            Err(_) => {
                self.live = None;
                None
            }
        }
    }
}

struct Scheduler {
    local_swarm: String,
    agents: HashMap<String, AgentDescriptor>,
    entrypoint: String,
    actions: ActionExecutor,
    clock: Arc<dyn Clock>,
    event_ring_capacity: usize,
    stream_ping_interval: Duration,
    queue: BinaryHeap<QueueEntry>,
    histories: HashMap<(String, Uuid), Vec<HistoryEntry>>,
    tasks: HashMap<Uuid, TaskRecord>,
    task_inflight: HashMap<Uuid, u32>,
    seq_counter: u64,
    invocations: JoinSet<InvocationOutcome>,
    router: Option<Arc<Router>>,
    registry: Option<Arc<SwarmRegistry>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    shutting_down: bool,
    shutdown_deadline: Option<Instant>,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl Scheduler {
    fn create_task(&mut self, task_id: Uuid, seed: &Envelope) {
        let sender = seed.kind.sender();
        let owner = format!(
            "{}:{}@{}",
            owner_role(sender.kind),
            sender.local_name(),
            self.local_swarm
        );
        let mut contributors = std::collections::HashSet::new();
        contributors.insert(owner.clone());
        if let Some(swarm) = &seed.sender_swarm {
            contributors.insert(swarm.clone());
        }
        let (tx, _rx) = broadcast::channel(256);
        self.tasks.insert(
            task_id,
            TaskRecord {
                owner,
                contributors,
                status: TaskStatus::Running,
                ring: EventRing::new(self.event_ring_capacity),
                tx,
                pending: None,
                breakpoint_stash: Vec::new(),
                completed_once: false,
                has_stream: false,
            },
        );
    }

    fn append_event(&mut self, task_id: Uuid, kind: EventKind, description: impl Into<String>, extra: Value) {
        let id = self.clock.new_id();
        let now = self.clock.now();
        let record = EventRecord::new(kind, task_id, description, extra, now, id);
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.ring.push(record.clone());
            let _ = task.tx.send(record);
        }
    }

    fn inc_inflight(&mut self, task_id: Uuid) {
        *self.task_inflight.entry(task_id).or_insert(0) += 1;
    }

    fn dec_inflight(&mut self, task_id: Uuid) {
        if let Some(c) = self.task_inflight.get_mut(&task_id) {
            if *c > 0 {
                *c -= 1;
            }
        }
    }

    fn is_busy(&self, task_id: Uuid) -> bool {
        self.task_inflight.get(&task_id).copied().unwrap_or(0) > 0
    }

    /// Splits an envelope's recipients into a local-only envelope and one
    /// per-leg remote envelope, per spec.md §4.7's detection rule.
    fn split_local_remote(&self, env: Envelope) -> (Option<Envelope>, Vec<Envelope>) {
        let local_swarm = self.local_swarm.clone();

        fn set_recipients(e: &mut Envelope, recipients: Vec<Address>) {
            match &mut e.kind {
                EnvelopeKind::Broadcast(p) | EnvelopeKind::Interrupt(p) | EnvelopeKind::TaskComplete(p) => {
                    p.recipients = recipients;
                }
                _ => {}
            }
        }

        match &env.kind {
            EnvelopeKind::Request(_) | EnvelopeKind::Response(_) => {
                let recipient = match &env.kind {
                    EnvelopeKind::Request(p) => p.recipient.clone(),
                    EnvelopeKind::Response(p) => p.recipient.clone(),
                    _ => unreachable!(),
                };
                if recipient.is_remote(&local_swarm) {
                    let swarm = recipient.split_swarm().1.unwrap().to_string();
                    let mut e = env.clone();
                    let bare = Address::agent(recipient.local_name().to_string());
                    match &mut e.kind {
                        EnvelopeKind::Request(p) => p.recipient = bare,
                        EnvelopeKind::Response(p) => p.recipient = bare,
                        _ => {}
                    }
                    e.recipient_swarms = vec![swarm];
                    (None, vec![e])
                } else {
                    (Some(env), vec![])
                }
            }
            EnvelopeKind::Broadcast(_) | EnvelopeKind::Interrupt(_) | EnvelopeKind::TaskComplete(_) => {
                let recipients: Vec<Address> = match &env.kind {
                    EnvelopeKind::Broadcast(p) | EnvelopeKind::Interrupt(p) | EnvelopeKind::TaskComplete(p) => {
                        p.recipients.clone()
                    }
                    _ => unreachable!(),
                };
                let mut local_recipients = Vec::new();
                let mut by_swarm: HashMap<String, Vec<Address>> = HashMap::new();
                for r in recipients {
                    if r.is_remote(&local_swarm) {
                        let swarm = r.split_swarm().1.unwrap().to_string();
                        by_swarm
                            .entry(swarm)
                            .or_default()
                            .push(Address::agent(r.local_name().to_string()));
                    } else {
                        local_recipients.push(r);
                    }
                }
                let local_env = if local_recipients.is_empty() {
                    None
                } else {
                    let mut e = env.clone();
                    set_recipients(&mut e, local_recipients);
                    Some(e)
                };
                let remote_envs = by_swarm
                    .into_iter()
                    .map(|(swarm, recipients)| {
                        let mut e = env.clone();
                        set_recipients(&mut e, recipients);
                        e.recipient_swarms = vec![swarm];
                        e
                    })
                    .collect();
                (local_env, remote_envs)
            }
        }
    }

    fn enqueue(&mut self, env: Envelope) {
        let task_id = env.task_id;
        if !self.tasks.contains_key(&task_id) {
            self.create_task(task_id, &env);
        } else if let Some(swarm) = env.sender_swarm.clone() {
            if let Some(task) = self.tasks.get_mut(&task_id) {
                task.contributors.insert(swarm);
            }
        }

        let (local_env, remote_envs) = self.split_local_remote(env);

        if let Some(local) = local_env {
            let tier = tier_of(&local);
            self.seq_counter += 1;
            self.queue.push(QueueEntry {
                envelope: local,
                tier,
                seq: self.seq_counter,
            });
        }

        if !remote_envs.is_empty() {
            if let Some(router) = self.router.clone() {
                let (owner, contributors, stream) = self
                    .tasks
                    .get(&task_id)
                    .map(|t| (t.owner.clone(), t.contributors.iter().cloned().collect::<Vec<_>>(), t.has_stream))
                    .unwrap_or_default();
                for mut leg in remote_envs {
                    if stream {
                        leg.routing_info.insert("stream".to_string(), "true".to_string());
                    }
                    let router = router.clone();
                    let owner = owner.clone();
                    let contributors = contributors.clone();
                    self.invocations.spawn(async move {
                        router.forward(leg, owner, contributors).await;
                        InvocationOutcome::Noop
                    });
                }
            } else {
                for leg in remote_envs {
                    log::warn!("no router attached; dropping remote-addressed envelope {}", leg.id);
                }
            }
        }
    }

    fn expand_recipients(&mut self, env: &Envelope) -> Vec<String> {
        let sender_name = env.kind.sender().local_name().to_string();
        let all_agent_names: Vec<String> = self.agents.keys().cloned().collect();
        let mut names = Vec::new();
        match &env.kind {
            EnvelopeKind::Request(p) => names.push(p.recipient.local_name().to_string()),
            EnvelopeKind::Response(p) => names.push(p.recipient.local_name().to_string()),
            EnvelopeKind::Broadcast(p) | EnvelopeKind::Interrupt(p) | EnvelopeKind::TaskComplete(p) => {
                for r in &p.recipients {
                    if r.is_all() {
                        for n in &all_agent_names {
                            if n != &sender_name {
                                names.push(n.clone());
                            }
                        }
                    } else {
                        names.push(r.local_name().to_string());
                    }
                }
            }
        }
        names.sort();
        names.dedup();

        let mut resolved = Vec::new();
        let mut errors = Vec::new();
        for n in names {
            if all_agent_names.contains(&n) {
                resolved.push(n);
            } else {
                log::warn!("unknown recipient '{}'; dropping envelope {}", n, env.id);
                errors.push(Envelope::system_response(
                    "router_error",
                    Address::agent(sender_name.clone()),
                    format!("unknown recipient: {}", n),
                    env.task_id,
                    self.clock.as_ref(),
                ));
            }
        }
        for e in errors {
            self.enqueue(e);
        }
        resolved
    }

    fn dispatch_one(&mut self, entry: QueueEntry) {
        let env = entry.envelope;
        let task_id = env.task_id;
        self.append_event(
            task_id,
            EventKind::NewMessage,
            format!("{} from {}", env.kind.label(), env.kind.sender()),
            json!({"envelope_id": env.id.to_string()}),
        );

        let recipients = self.expand_recipients(&env);
        for recipient_name in recipients {
            let Some(descriptor) = self.agents.get(&recipient_name) else {
                continue;
            };
            let history_key = (recipient_name.clone(), task_id);
            let rendered = env.render_for_agent();
            self.histories
                .entry(history_key.clone())
                .or_default()
                .push(HistoryEntry::new(HistoryRole::User, rendered));
            let history_snapshot = self.histories[&history_key].clone();
            let func = descriptor.func.clone();
            let in_reply_to = match &env.kind {
                EnvelopeKind::Request(p) => Some(p.request_id),
                _ => None,
            };
            self.inc_inflight(task_id);
            self.invocations.spawn(async move {
                let result = func.invoke(&history_snapshot).await;
                InvocationOutcome::Agent {
                    task_id,
                    agent_name: recipient_name,
                    in_reply_to,
                    result,
                }
            });
        }
    }

    fn drain_dispatch(&mut self) {
        loop {
            let mut deferred = Vec::new();
            let mut dispatched = None;
            while let Some(entry) = self.queue.pop() {
                let task_id = entry.envelope.task_id;
                let paused = self
                    .tasks
                    .get(&task_id)
                    .map(|t| t.status == TaskStatus::Paused)
                    .unwrap_or(false);
                if paused || self.is_busy(task_id) {
                    deferred.push(entry);
                    continue;
                }
                dispatched = Some(entry);
                break;
            }
            for d in deferred {
                self.queue.push(d);
            }
            match dispatched {
                Some(entry) => self.dispatch_one(entry),
                None => break,
            }
        }
    }

    async fn handle_tool_call(&mut self, task_id: Uuid, agent_name: &str, in_reply_to: Option<Uuid>, call: ToolCallRequest) {
        self.append_event(
            task_id,
            EventKind::ToolCall,
            format!("{} called {}", agent_name, call.name),
            json!({"arguments": call.arguments}),
        );

        if is_builtin_tool(&call.name) {
            let comm_targets = self
                .agents
                .get(agent_name)
                .map(|d| d.comm_targets.clone())
                .unwrap_or_default();
            let sender = Address::agent(agent_name.to_string());
            match parse_tool_call(&call)
                .and_then(|tool| call_to_envelope(&tool, &sender, &comm_targets, in_reply_to, task_id, self.clock.as_ref()))
            {
                Ok(effect) => self.apply_catalog_effect(task_id, agent_name, effect),
                Err(e) => {
                    log::warn!("tool_call_error for {}: {}", agent_name, e);
                    let env = Envelope::system_response("tool_call_error", sender, e.to_string(), task_id, self.clock.as_ref());
                    self.enqueue(env);
                }
            }
            return;
        }

        let caller_actions = self
            .agents
            .get(agent_name)
            .map(|d| d.actions.clone())
            .unwrap_or_default();
        if !caller_actions.iter().any(|a| a == &call.name) || self.actions.get(&call.name).is_none() {
            let env = Envelope::system_response(
                "tool_call_error",
                Address::agent(agent_name.to_string()),
                format!("tool not found: {}", call.name),
                task_id,
                self.clock.as_ref(),
            );
            self.enqueue(env);
            return;
        }

        if self.actions.is_breakpoint(&call.name) {
            self.stash_breakpoint(task_id, agent_name, call);
            return;
        }

        let executor = self.actions.clone();
        let caller_addr = Address::agent(agent_name.to_string());
        self.inc_inflight(task_id);
        let call_clone = call.clone();
        self.invocations.spawn(async move {
            let result = executor.execute(&call_clone.name, call_clone.arguments.clone()).await;
            InvocationOutcome::Action {
                task_id,
                caller: caller_addr,
                call: call_clone,
                result,
            }
        });
    }

    fn apply_catalog_effect(&mut self, task_id: Uuid, agent_name: &str, effect: CatalogEffect) {
        match effect {
            CatalogEffect::Enqueue(env) | CatalogEffect::InterswarmBroadcast(env) => self.enqueue(env),
            CatalogEffect::CompleteTask(env) => self.complete_task(task_id, agent_name, env, false),
            CatalogEffect::AwaitMessage => {
                self.append_event(
                    task_id,
                    EventKind::NewMessage,
                    format!("{} awaiting message", agent_name),
                    json!({}),
                );
            }
            CatalogEffect::AcknowledgeBroadcast(note) => {
                let content = match note {
                    Some(n) => format!("acknowledged: {}", n),
                    None => "acknowledged".to_string(),
                };
                self.histories
                    .entry((agent_name.to_string(), task_id))
                    .or_default()
                    .push(HistoryEntry::new(HistoryRole::System, content));
            }
            CatalogEffect::IgnoreBroadcast => {}
            CatalogEffect::DiscoverSwarms(urls) => {
                if let Some(registry) = self.registry.clone() {
                    self.invocations.spawn(async move {
                        for url in urls {
                            if let Err(e) = registry.discover(&url).await {
                                log::warn!("discover_swarms failed for {}: {}", url, e);
                            }
                        }
                        InvocationOutcome::Noop
                    });
                }
            }
        }
    }

    fn stash_breakpoint(&mut self, task_id: Uuid, agent_name: &str, call: ToolCallRequest) {
        let mut remaining = BinaryHeap::new();
        let mut stashed = Vec::new();
        while let Some(e) = self.queue.pop() {
            if e.envelope.task_id == task_id {
                stashed.push(e);
            } else {
                remaining.push(e);
            }
        }
        self.queue = remaining;

        let description = format!("{} called breakpoint action {}", agent_name, call.name);
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Paused;
            task.breakpoint_stash.push(BreakpointStash {
                queued: stashed,
                caller: agent_name.to_string(),
            });
        }
        self.append_event(
            task_id,
            EventKind::BreakpointToolCall,
            description,
            json!({"action": call.name, "arguments": call.arguments}),
        );
    }

    /// `from_remote` is set when this completion arrived as a forwarded
    /// `task_complete` from a contributor swarm rather than from a local
    /// agent's tool call; the local `can_complete_tasks` gate doesn't apply
    /// since the contributor's own swarm already enforced it.
    fn complete_task(&mut self, task_id: Uuid, agent_name: &str, env: Envelope, from_remote: bool) {
        if !from_remote {
            let can_complete = self.agents.get(agent_name).map(|d| d.can_complete_tasks).unwrap_or(false);
            if !can_complete {
                log::warn!("{} attempted task_complete without can_complete_tasks", agent_name);
                return;
            }
        }
        let already_completed = self.tasks.get(&task_id).map(|t| t.completed_once).unwrap_or(true);
        if already_completed {
            log::warn!("duplicate task_complete for {} discarded", task_id);
            return;
        }
        let finish_body = match &env.kind {
            EnvelopeKind::TaskComplete(p) => p.body.clone(),
            _ => String::new(),
        };
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.completed_once = true;
            task.status = TaskStatus::Completed;
        }
        self.append_event(
            task_id,
            EventKind::TaskComplete,
            format!("completed by {}", agent_name),
            json!({"finish_message": finish_body}),
        );
        if let Some(task) = self.tasks.get_mut(&task_id) {
            if let Some(pending) = task.pending.take() {
                let _ = pending.send(Ok(finish_body));
            }
        }

        // Cross-swarm forwarding (spec.md §4.7): a contributor that isn't the
        // task owner forwards its completion upstream via `/interswarm/back`
        // instead of treating the task as resolved here; the owner broadcasts
        // completion out to every remote contributor, best-effort.
        if let (Some(router), Some(task)) = (self.router.clone(), self.tasks.get(&task_id)) {
            let owner = task.owner.clone();
            let contributors: Vec<String> = task.contributors.iter().cloned().collect();
            let local_swarm = self.local_swarm.clone();
            if owner_swarm(&owner) != local_swarm {
                let mut leg = env.clone();
                leg.recipient_swarms = vec![owner_swarm(&owner).to_string()];
                let owner = owner.clone();
                let contributors = contributors.clone();
                self.invocations.spawn(async move {
                    router.forward_task_complete(leg, owner, contributors).await;
                    InvocationOutcome::Noop
                });
            } else {
                let mut remote_swarms: Vec<String> = contributors
                    .iter()
                    .map(|c| owner_swarm(c).to_string())
                    .filter(|s| s != &local_swarm)
                    .collect();
                remote_swarms.sort();
                remote_swarms.dedup();
                for swarm in remote_swarms {
                    let mut leg = env.clone();
                    leg.recipient_swarms = vec![swarm];
                    let router = router.clone();
                    let owner = owner.clone();
                    let contributors = contributors.clone();
                    self.invocations.spawn(async move {
                        router.forward_task_complete(leg, owner, contributors).await;
                        InvocationOutcome::Noop
                    });
                }
            }
        }
    }

    fn cancel_task(&mut self, task_id: Uuid, err: RuntimeError) {
        let mut remaining = BinaryHeap::new();
        while let Some(e) = self.queue.pop() {
            if e.envelope.task_id != task_id {
                remaining.push(e);
            }
        }
        self.queue = remaining;

        let description = err.to_string();
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Errored;
            if let Some(pending) = task.pending.take() {
                let _ = pending.send(Err(err));
            }
        }
        self.append_event(task_id, EventKind::TaskError, description, json!({}));
    }

    async fn handle_invocation_outcome(&mut self, outcome: InvocationOutcome) {
        match outcome {
            InvocationOutcome::Noop => {}
            InvocationOutcome::Agent {
                task_id,
                agent_name,
                in_reply_to,
                result,
            } => {
                self.dec_inflight(task_id);
                match result {
                    Ok(output) => {
                        let text = output.text.clone().unwrap_or_default();
                        self.histories
                            .entry((agent_name.clone(), task_id))
                            .or_default()
                            .push(HistoryEntry::new(HistoryRole::Assistant, text));
                        for call in output.tool_calls {
                            self.handle_tool_call(task_id, &agent_name, in_reply_to, call).await;
                        }
                    }
                    Err(e) => {
                        log::warn!("agent '{}' raised: {}", agent_name, e);
                        self.append_event(
                            task_id,
                            EventKind::AgentError,
                            format!("{}: {}", agent_name, e),
                            json!({"agent": agent_name}),
                        );
                        let env = Envelope::system_response(
                            "agent_error",
                            Address::agent(agent_name.clone()),
                            e.to_string(),
                            task_id,
                            self.clock.as_ref(),
                        );
                        self.enqueue(env);
                    }
                }
            }
            InvocationOutcome::Action {
                task_id,
                caller,
                call,
                result,
            } => {
                self.dec_inflight(task_id);
                match result {
                    Ok(value) => {
                        self.append_event(
                            task_id,
                            EventKind::ActionComplete,
                            format!("{} completed", call.name),
                            json!({"result": value}),
                        );
                        let env = Envelope::system_response(&call.name, caller, value.to_string(), task_id, self.clock.as_ref());
                        self.enqueue(env);
                    }
                    Err(e) => {
                        log::warn!("action '{}' failed: {}", call.name, e);
                        self.append_event(
                            task_id,
                            EventKind::ActionCall,
                            format!("{} failed: {}", call.name, e),
                            json!({}),
                        );
                        let env = Envelope::system_response("tool_call_error", caller, e.to_string(), task_id, self.clock.as_ref());
                        self.enqueue(env);
                    }
                }
            }
        }
    }

    fn arm_timeout(&self, task_id: Uuid, timeout: Duration) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::TimeoutFired(task_id));
        });
    }

    /// Schedules the next `ping` heartbeat for an open stream. `PingTick`'s
    /// handler only re-arms itself while the task is still open, so the loop
    /// self-terminates once the task reaches a terminal status rather than
    /// needing an explicit stop signal.
    fn arm_ping(&self, task_id: Uuid, interval: Duration) {
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = tx.send(Command::PingTick(task_id));
        });
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(env) => self.enqueue(env),
            Command::SubmitAndWait { env, timeout, reply } => {
                let task_id = env.task_id;
                if !self.tasks.contains_key(&task_id) {
                    self.create_task(task_id, &env);
                }
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.pending = Some(reply);
                }
                self.enqueue(env);
                self.arm_timeout(task_id, timeout);
            }
            Command::SubmitAndStream { env, timeout, reply } => {
                let task_id = env.task_id;
                if !self.tasks.contains_key(&task_id) {
                    self.create_task(task_id, &env);
                }
                let already_streaming = self.tasks.get(&task_id).map(|t| t.has_stream).unwrap_or(false);
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.has_stream = true;
                }
                let stream = {
                    let task = self.tasks.get(&task_id).expect("task just created");
                    EventStream {
                        backlog: task.ring.snapshot().into(),
                        live: Some(task.tx.subscribe()),
                    }
                };
                let _ = reply.send(stream);
                self.enqueue(env);
                self.arm_timeout(task_id, timeout);
                if !already_streaming {
                    self.arm_ping(task_id, self.stream_ping_interval);
                }
            }
            Command::Resume {
                task_id,
                kind,
                body,
                extras,
                reply,
            } => {
                let result = self.handle_resume(task_id, kind, body, extras);
                let _ = reply.send(result);
            }
            Command::Cancel(task_id) => self.cancel_task(task_id, RuntimeError::Cancelled),
            Command::TimeoutFired(task_id) => {
                // Checked against task status rather than `pending.is_some()`
                // so a timeout cancels a task regardless of whether it was
                // started via `submit_and_wait` or `submit_and_stream` — only
                // the former ever populates `pending`.
                let still_open = self
                    .tasks
                    .get(&task_id)
                    .map(|t| matches!(t.status, TaskStatus::Running | TaskStatus::Paused))
                    .unwrap_or(false);
                if still_open {
                    self.cancel_task(task_id, RuntimeError::TaskTimeout);
                }
            }
            Command::PingTick(task_id) => {
                let still_open = self
                    .tasks
                    .get(&task_id)
                    .map(|t| matches!(t.status, TaskStatus::Running | TaskStatus::Paused))
                    .unwrap_or(false);
                if still_open {
                    self.append_event(task_id, EventKind::Ping, "heartbeat", json!({}));
                    self.arm_ping(task_id, self.stream_ping_interval);
                }
            }
            Command::InterswarmResponse(env) => {
                // A forwarded `task_complete` resolves the task directly
                // rather than re-entering the queue as an ordinary fanout —
                // it's the terminal signal for the task, not a message for
                // local agents to act on.
                if matches!(env.kind, EnvelopeKind::TaskComplete(_)) {
                    let agent_name = env.kind.sender().to_string();
                    self.complete_task(env.task_id, &agent_name, env, true);
                } else {
                    self.enqueue(env);
                }
            }
            Command::SetRouter(router) => self.router = Some(router),
            Command::SetRegistry(registry) => self.registry = Some(registry),
            Command::PendingRequests(reply) => {
                let ids = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| t.pending.is_some())
                    .map(|(id, _)| *id)
                    .collect();
                let _ = reply.send(ids);
            }
            Command::EventsFor { task_id, reply } => {
                let events = self.tasks.get(&task_id).map(|t| t.ring.snapshot()).unwrap_or_default();
                let _ = reply.send(events);
            }
            Command::HasTask { task_id, reply } => {
                let _ = reply.send(self.tasks.contains_key(&task_id));
            }
            Command::SeedTaskOwnership { task_id, owner, contributors } => {
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    for c in contributors {
                        task.contributors.insert(c);
                    }
                } else {
                    let (tx, _rx) = broadcast::channel(256);
                    self.tasks.insert(
                        task_id,
                        TaskRecord {
                            owner,
                            contributors: contributors.into_iter().collect(),
                            status: TaskStatus::Running,
                            ring: EventRing::new(self.event_ring_capacity),
                            tx,
                            pending: None,
                            breakpoint_stash: Vec::new(),
                            completed_once: false,
                            has_stream: false,
                        },
                    );
                }
            }
            Command::Shutdown { grace, reply } => {
                self.shutting_down = true;
                self.shutdown_deadline = Some(Instant::now() + grace);
                self.shutdown_reply = Some(reply);
            }
        }
    }

    fn handle_resume(
        &mut self,
        task_id: Uuid,
        kind: ResumeKind,
        body: Option<String>,
        extras: ResumeExtras,
    ) -> Result<(), RuntimeError> {
        match kind {
            ResumeKind::UserResponse => {
                if !self.tasks.contains_key(&task_id) {
                    return Err(RuntimeError::RuntimeFault(format!("unknown task_id: {}", task_id)));
                }
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    if task.status == TaskStatus::Completed {
                        task.status = TaskStatus::Running;
                    }
                }
                let env = Envelope::construct(
                    EnvelopeKind::Request(crate::mail::message::RequestPayload {
                        sender: Address::user("user"),
                        recipient: Address::agent(self.entrypoint.clone()),
                        subject: crate::mail::message::system_marker("resume"),
                        body: body.unwrap_or_default(),
                        request_id: self.clock.new_id(),
                    }),
                    task_id,
                    self.clock.as_ref(),
                )
                .map_err(|e| RuntimeError::RuntimeFault(e.to_string()))?;
                self.enqueue(env);
                Ok(())
            }
            ResumeKind::BreakpointToolCall => {
                let result_json = extras
                    .breakpoint_tool_call_result
                    .ok_or_else(|| RuntimeError::RuntimeFault("missing breakpoint_tool_call_result".to_string()))?;

                let stashes = {
                    let task = self
                        .tasks
                        .get_mut(&task_id)
                        .ok_or_else(|| RuntimeError::RuntimeFault(format!("unknown task_id: {}", task_id)))?;
                    if task.breakpoint_stash.is_empty() {
                        return Err(RuntimeError::RuntimeFault(format!("no stashed breakpoint for task {}", task_id)));
                    }
                    std::mem::take(&mut task.breakpoint_stash)
                };

                // May decode to one object (resolves the single stashed
                // breakpoint) or an array (resolves each stash, in the order
                // the breakpoints were hit).
                let parsed: Value = serde_json::from_str(&result_json)
                    .map_err(|e| RuntimeError::RuntimeFault(format!("invalid breakpoint_tool_call_result: {}", e)))?;
                let results: Vec<Value> = match parsed {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                if results.len() != stashes.len() {
                    log::warn!(
                        "breakpoint_tool_call_result has {} entries but {} breakpoints are stashed for task {}",
                        results.len(),
                        stashes.len(),
                        task_id
                    );
                }

                // The caller name for each entry comes from its stash,
                // recorded when that breakpoint was hit, not from the resumer.
                for (stash, result) in stashes.into_iter().zip(results.into_iter().chain(std::iter::repeat(Value::Null))) {
                    self.histories
                        .entry((stash.caller, task_id))
                        .or_default()
                        .push(HistoryEntry::new(HistoryRole::Tool, result.to_string()));
                    for entry in stash.queued {
                        self.queue.push(entry);
                    }
                }
                if let Some(task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Running;
                }
                Ok(())
            }
        }
    }

    async fn run(mut self) {
        loop {
            let deadline_sleep = async {
                match self.shutdown_deadline {
                    Some(d) => tokio::time::sleep_until(d.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                Some(res) = self.invocations.join_next(), if !self.invocations.is_empty() => {
                    match res {
                        Ok(outcome) => self.handle_invocation_outcome(outcome).await,
                        Err(join_err) => log::error!("invocation task panicked: {}", join_err),
                    }
                }
                _ = deadline_sleep => {
                    if self.shutting_down {
                        let task_ids: Vec<Uuid> = self.tasks.keys().copied().collect();
                        for id in task_ids {
                            self.cancel_task(id, RuntimeError::ShuttingDown);
                        }
                        self.shutdown_deadline = None;
                    }
                }
            }

            self.drain_dispatch();

            if self.shutting_down
                && self.shutdown_deadline.is_none()
                && self.queue.is_empty()
                && self.invocations.is_empty()
            {
                if let Some(reply) = self.shutdown_reply.take() {
                    let _ = reply.send(());
                }
                break;
            }
        }
    }
}

/// Public handle to a running scheduler. Cheap to clone; every clone talks to
/// the same dispatch loop.
#[derive(Clone)]
pub struct Runtime {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Runtime {
    /// Spawns the dispatch loop and returns a handle to it. Must be called
    /// from within a running `tokio` runtime.
    pub fn new(
        local_swarm: impl Into<String>,
        agents: Vec<AgentDescriptor>,
        actions: ActionExecutor,
        event_ring_capacity: usize,
        clock: Arc<dyn Clock>,
        stream_ping_interval: Duration,
    ) -> Result<Self, crate::mail::error::SwarmError> {
        use crate::mail::error::SwarmError;

        let mut entrypoint = None;
        let mut has_supervisor = false;
        let mut by_name: HashMap<String, AgentDescriptor> = HashMap::new();
        for agent in agents {
            if agent.name == crate::mail::message::ALL {
                return Err(SwarmError::ReservedAgentName);
            }
            if by_name.contains_key(&agent.name) {
                return Err(SwarmError::DuplicateAgentName(agent.name));
            }
            if agent.enable_entrypoint {
                if let Some(existing) = &entrypoint {
                    return Err(SwarmError::MultipleEntrypoints {
                        first: existing.clone(),
                        second: agent.name.clone(),
                    });
                }
                entrypoint = Some(agent.name.clone());
            }
            has_supervisor |= agent.can_complete_tasks;
            by_name.insert(agent.name.clone(), agent);
        }
        let agent_names: Vec<String> = by_name.keys().cloned().collect();
        for agent in by_name.values() {
            for target in &agent.comm_targets {
                if target != crate::mail::message::ALL && !agent_names.contains(target) {
                    return Err(SwarmError::UnknownCommTarget {
                        agent: agent.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
        let entrypoint = entrypoint.ok_or(SwarmError::NoEntrypoint)?;
        if !has_supervisor {
            return Err(SwarmError::NoSupervisor);
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            local_swarm: local_swarm.into(),
            agents: by_name,
            entrypoint,
            actions,
            clock,
            event_ring_capacity,
            stream_ping_interval,
            queue: BinaryHeap::new(),
            histories: HashMap::new(),
            tasks: HashMap::new(),
            task_inflight: HashMap::new(),
            seq_counter: 0,
            invocations: JoinSet::new(),
            router: None,
            registry: None,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            shutting_down: false,
            shutdown_deadline: None,
            shutdown_reply: None,
        };
        tokio::spawn(scheduler.run());
        Ok(Self { cmd_tx })
    }

    pub fn attach_router(&self, router: Arc<Router>) {
        let _ = self.cmd_tx.send(Command::SetRouter(router));
    }

    pub fn attach_registry(&self, registry: Arc<SwarmRegistry>) {
        let _ = self.cmd_tx.send(Command::SetRegistry(registry));
    }

    pub fn submit(&self, env: Envelope) {
        let _ = self.cmd_tx.send(Command::Submit(env));
    }

    pub async fn submit_and_wait(&self, env: Envelope, timeout: Duration) -> Result<String, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SubmitAndWait {
                env,
                timeout,
                reply: reply_tx,
            })
            .map_err(|_| RuntimeError::ShuttingDown)?;
        reply_rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    pub async fn submit_and_stream(&self, env: Envelope, timeout: Duration) -> Result<EventStream, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::SubmitAndStream {
                env,
                timeout,
                reply: reply_tx,
            })
            .map_err(|_| RuntimeError::ShuttingDown)?;
        reply_rx.await.map_err(|_| RuntimeError::ShuttingDown)
    }

    pub async fn resume(&self, task_id: Uuid, kind: ResumeKind, body: Option<String>, extras: ResumeExtras) -> Result<(), RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Resume {
                task_id,
                kind,
                body,
                extras,
                reply: reply_tx,
            })
            .map_err(|_| RuntimeError::ShuttingDown)?;
        reply_rx.await.map_err(|_| RuntimeError::ShuttingDown)?
    }

    pub fn cancel(&self, task_id: Uuid) {
        let _ = self.cmd_tx.send(Command::Cancel(task_id));
    }

    /// Injects a remote envelope (inbound forward, or the owner resolving a
    /// `response` originating on a contributor swarm) into this runtime.
    pub fn handle_interswarm_response(&self, env: Envelope) {
        let _ = self.cmd_tx.send(Command::InterswarmResponse(env));
    }

    /// Whether this runtime has any record of `task_id` (local or seeded via
    /// an inbound interswarm delivery).
    pub async fn has_task(&self, task_id: Uuid) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::HasTask { task_id, reply: reply_tx }).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Records `task_id`'s owner/contributors ahead of enqueueing an inbound
    /// interswarm payload for it. Fire-and-forget: ordering with a
    /// subsequently submitted `InterswarmResponse` is preserved because both
    /// travel over the same `mpsc` channel from the same caller.
    pub fn seed_interswarm_task(&self, task_id: Uuid, owner: String, contributors: Vec<String>) {
        let _ = self.cmd_tx.send(Command::SeedTaskOwnership { task_id, owner, contributors });
    }

    pub async fn shutdown(&self, grace: Duration) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Shutdown { grace, reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    pub async fn pending_requests(&self) -> Vec<Uuid> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::PendingRequests(reply_tx)).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn events_for(&self, task_id: Uuid) -> Vec<EventRecord> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::EventsFor {
                task_id,
                reply: reply_tx,
            })
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Constructs an `all`-addressed `FanoutPayload` for `send_broadcast`-style
/// callers outside the tool catalog (e.g. swarm-level fanout helpers).
pub fn all_fanout(sender: Address, subject: impl Into<String>, body: impl Into<String>, fanout_id: Uuid) -> FanoutPayload {
    FanoutPayload {
        sender,
        recipients: vec![Address::all_agents()],
        subject: subject.into(),
        body: body.into(),
        fanout_id,
    }
}
