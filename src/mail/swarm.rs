//! Swarm container: the thing an embedder actually constructs. Wires a
//! [`Runtime`], a [`SwarmRegistry`], and a [`Router`] together behind one
//! handle and exposes the conversational entry points.
//!
//! Grounded in the teacher crate's `ClientWrapper`/session-builder pattern
//! (`client_wrapper.rs`): a small struct assembled once at startup that owns
//! its collaborators and exposes a handful of `async fn`s, rather than a
//! global registry of swarms.

use crate::mail::action_executor::ActionExecutor;
use crate::mail::agent::AgentDescriptor;
use crate::mail::config::MailConfig;
use crate::mail::error::{RuntimeError, SwarmError};
use crate::mail::message::{Address, Clock, Envelope, EnvelopeKind, RequestPayload};
use crate::mail::registry::SwarmRegistry;
use crate::mail::router::Router;
use crate::mail::runtime::{EventStream, Runtime};
use std::sync::Arc;
use uuid::Uuid;

/// A fully assembled multi-agent swarm: one scheduler, one peer registry, one
/// inter-swarm router.
pub struct Swarm {
    name: String,
    runtime: Runtime,
    registry: Arc<SwarmRegistry>,
    #[allow(dead_code)]
    router: Arc<Router>,
    clock: Arc<dyn Clock>,
    config: MailConfig,
}

impl Swarm {
    /// Validates the agent roster (exactly one entrypoint, at least one
    /// supervisor, every `comm_targets` entry resolvable, no agent named
    /// `"all"`) and spins up the runtime, registry, and router.
    pub fn new(
        agents: Vec<AgentDescriptor>,
        actions: ActionExecutor,
        config: MailConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SwarmError> {
        let runtime = Runtime::new(
            config.local_swarm_name.clone(),
            agents,
            actions,
            config.event_ring_capacity,
            clock.clone(),
            config.stream_ping_interval,
        )?;

        let registry = Arc::new(SwarmRegistry::new(
            config.health_check_interval,
            config.health_check_failure_threshold,
        ));
        let _ = registry.load();

        let router = Arc::new(Router::new(
            config.local_swarm_name.clone(),
            registry.clone(),
            runtime.clone(),
            config.router_request_timeout,
            config.router_dedup_capacity,
        ));
        runtime.attach_router(router.clone());
        runtime.attach_registry(registry.clone());

        Ok(Self {
            name: config.local_swarm_name.clone(),
            runtime,
            registry,
            router,
            clock,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<SwarmRegistry> {
        &self.registry
    }

    pub async fn start_health_checks(&self) {
        self.registry.start_health().await;
    }

    pub async fn stop_health_checks(&self) {
        self.registry.stop_health().await;
    }

    fn seed_request(&self, recipient: &str, body: impl Into<String>, task_id: Uuid) -> Envelope {
        Envelope::construct(
            EnvelopeKind::Request(RequestPayload {
                sender: Address::user("user"),
                recipient: Address::agent(recipient.to_string()),
                subject: "message".to_string(),
                body: body.into(),
                request_id: self.clock.new_id(),
            }),
            task_id,
            self.clock.as_ref(),
        )
        .expect("user request always satisfies the request schema")
    }

    /// Submits `body` as a new task addressed to the swarm's entrypoint agent
    /// and blocks until a supervisor calls `task_complete`, or the configured
    /// `default_submit_timeout` elapses.
    pub async fn post_message(&self, entrypoint: &str, body: impl Into<String>) -> Result<String, RuntimeError> {
        let task_id = self.clock.new_id();
        let env = self.seed_request(entrypoint, body, task_id);
        self.runtime.submit_and_wait(env, self.config.default_submit_timeout).await
    }

    /// Like [`post_message`](Self::post_message) but returns an `EventStream`
    /// instead of blocking for the final result.
    pub async fn post_message_stream(&self, entrypoint: &str, body: impl Into<String>) -> Result<EventStream, RuntimeError> {
        let task_id = self.clock.new_id();
        let env = self.seed_request(entrypoint, body, task_id);
        self.runtime.submit_and_stream(env, self.config.default_submit_timeout).await
    }

    /// Starts a task without waiting for completion, returning its `task_id`
    /// so the caller can `resume()` it across further turns (an
    /// open-ended conversation rather than one request/response round). The
    /// task itself keeps running on the runtime's background dispatch loop;
    /// this call only enqueues the seed envelope and returns immediately.
    pub fn start_task(&self, entrypoint: &str, body: impl Into<String>) -> Uuid {
        let task_id = self.clock.new_id();
        let env = self.seed_request(entrypoint, body, task_id);
        self.runtime.submit(env);
        task_id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub async fn shutdown(&self) {
        self.registry.stop_health().await;
        self.runtime.shutdown(self.config.shutdown_grace_period).await;
    }
}
