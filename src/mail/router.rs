//! Inter-swarm router: wraps outbound envelopes for peer swarms and accepts
//! inbound ones over HTTP, keeping delivery idempotent across retries.
//!
//! Grounded in the teacher crate's `clients/http_client_pool.rs` (`DashMap`-pooled
//! `reqwest::Client`s, one per upstream host) generalized from "one client
//! per LM provider" to "one client per peer swarm", plus the bearer-token
//! validation shape from `config.rs`'s `AuthConfig::validate`.

use crate::mail::error::RouterError;
use crate::mail::message::{Address, Envelope, EnvelopeKind};
use crate::mail::registry::{constant_time_token_eq, SwarmRegistry};
use crate::mail::runtime::{owner_swarm, Runtime};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// The wire envelope exchanged between swarms over `/interswarm/forward` and
/// `/interswarm/back`, per the inter-swarm message format.
#[derive(Debug, Serialize, Deserialize)]
struct InterswarmEnvelope {
    message_id: Uuid,
    source_swarm: String,
    target_swarm: String,
    timestamp: DateTime<Utc>,
    payload: Envelope,
    task_owner: String,
    task_contributors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// The HTTP body shape posted to `/interswarm/forward` and `/interswarm/back`:
/// `{"message": <wire envelope>}`.
#[derive(Debug, Deserialize)]
struct InboundBody {
    message: InterswarmEnvelope,
}

struct Dedup {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl Dedup {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(256)),
            seen: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `true` the first time `id` is seen, `false` on any replay.
    fn first_sighting(&mut self, id: Uuid) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.seen.insert(id);
        true
    }
}

/// Routes envelopes that name a remote recipient to the owning peer swarm,
/// and accepts inbound deliveries from peers addressed to local agents.
pub struct Router {
    local_swarm: String,
    registry: Arc<SwarmRegistry>,
    clients: DashMap<String, reqwest::Client>,
    runtime: Runtime,
    request_timeout: Duration,
    dedup: Mutex<Dedup>,
}

impl Router {
    pub fn new(
        local_swarm: impl Into<String>,
        registry: Arc<SwarmRegistry>,
        runtime: Runtime,
        request_timeout: Duration,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            local_swarm: local_swarm.into(),
            registry,
            clients: DashMap::new(),
            runtime,
            request_timeout,
            dedup: Mutex::new(Dedup::new(dedup_capacity)),
        }
    }

    fn client_for(&self, swarm: &str) -> reqwest::Client {
        self.clients
            .entry(swarm.to_string())
            .or_insert_with(reqwest::Client::new)
            .clone()
    }

    fn outbound_path(kind: &EnvelopeKind) -> &'static str {
        match kind {
            EnvelopeKind::Response(_) => "interswarm/back",
            _ => "interswarm/forward",
        }
    }

    /// Sends `env` (already scoped to a single remote swarm by
    /// `recipient_swarms`) to its peer. Transport and auth failures are
    /// translated into a `::router_error::` response delivered to the
    /// original local sender rather than propagated to the caller, per the
    /// "errors surface as MAIL messages, not panics" rule.
    pub async fn forward(&self, env: Envelope, task_owner: String, task_contributors: Vec<String>) {
        let Some(swarm) = env.recipient_swarms.first().cloned() else {
            log::warn!("forward() called on an envelope with no recipient_swarms: {}", env.id);
            return;
        };
        let path = Self::outbound_path(&env.kind);
        if let Err(e) = self.try_forward(&swarm, &env, path, &task_owner, &task_contributors).await {
            log::warn!("interswarm forward to '{}' failed: {}", swarm, e);
            let original_sender = Address::agent(env.kind.sender().local_name().to_string());
            let response = Envelope::system_response(
                "router_error",
                original_sender,
                e.to_string(),
                env.task_id,
                &crate::mail::message::SystemClock,
            );
            self.runtime.submit(response);
        }
    }

    /// Forwards a `task_complete` across swarms: either a contributor
    /// reporting completion back to the task owner, or the owner
    /// broadcasting completion to a contributor. Always continues an
    /// existing task, so it always targets `/interswarm/back` regardless of
    /// the envelope's own kind.
    pub async fn forward_task_complete(&self, env: Envelope, task_owner: String, task_contributors: Vec<String>) {
        let Some(swarm) = env.recipient_swarms.first().cloned() else {
            log::warn!("forward_task_complete() called on an envelope with no recipient_swarms: {}", env.id);
            return;
        };
        if let Err(e) = self.try_forward(&swarm, &env, "interswarm/back", &task_owner, &task_contributors).await {
            log::warn!("interswarm task_complete forward to '{}' failed: {}", swarm, e);
        }
    }

    async fn try_forward(
        &self,
        swarm: &str,
        env: &Envelope,
        path: &str,
        task_owner: &str,
        task_contributors: &[String],
    ) -> Result<(), RouterError> {
        let entry = self.registry.get(swarm).ok_or_else(|| RouterError::UnknownPeer(swarm.to_string()))?;
        let token = self.registry.resolve_token(swarm)?;
        let url = format!("{}/{}", entry.base_url.trim_end_matches('/'), path);
        let mut contributors: Vec<String> = task_contributors.to_vec();
        if !contributors.iter().any(|c| c == task_owner) {
            contributors.push(task_owner.to_string());
        }
        let mut metadata = serde_json::Map::new();
        if matches!(env.kind, EnvelopeKind::Request(_)) {
            metadata.insert("expect_response".to_string(), serde_json::Value::Bool(true));
        }
        let wire = InterswarmEnvelope {
            message_id: env.id,
            source_swarm: self.local_swarm.clone(),
            target_swarm: swarm.to_string(),
            timestamp: Utc::now(),
            payload: env.clone(),
            task_owner: task_owner.to_string(),
            task_contributors: contributors,
            auth_token: None,
            metadata,
        };
        let client = self.client_for(swarm);
        let response = client
            .post(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "message": wire }))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| RouterError::UnreachablePeer {
                swarm: swarm.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(RouterError::NonSuccessStatus {
                swarm: swarm.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Validates and decodes a raw request body posted to this swarm's
    /// `/interswarm/forward` or `/interswarm/back` endpoint, returning the
    /// envelope to inject once the caller has confirmed a 2xx is warranted.
    /// Delivery is idempotent: a replayed `message_id` is accepted (so the
    /// peer's retry doesn't error) but produces no second enqueue.
    pub async fn handle_inbound(&self, bearer_token: &str, body: &str) -> Result<(), RouterError> {
        let wire: InterswarmEnvelope = serde_json::from_str::<InboundBody>(body)
            .map_err(|e| RouterError::UnreachablePeer {
                swarm: "unknown".to_string(),
                reason: format!("malformed interswarm envelope: {}", e),
            })?
            .message;
        let expected = self.registry.resolve_token(&wire.source_swarm)?;
        if !constant_time_token_eq(&expected, bearer_token) {
            return Err(RouterError::MissingAuthToken {
                env_var: crate::mail::registry::auth_env_var(&wire.source_swarm),
            });
        }

        let is_new = self.dedup.lock().expect("dedup mutex poisoned").first_sighting(wire.message_id);
        if !is_new {
            log::debug!("duplicate interswarm delivery of {} ignored", wire.message_id);
            return Ok(());
        }

        let mut envelope = wire.payload;
        envelope.sender_swarm = Some(wire.source_swarm.clone());

        if matches!(envelope.kind, EnvelopeKind::Response(_))
            && owner_swarm(&wire.task_owner) == self.local_swarm
            && !self.runtime.has_task(envelope.task_id).await
        {
            return Err(RouterError::UnknownTaskOwner {
                task_id: envelope.task_id.to_string(),
            });
        }

        self.runtime.seed_interswarm_task(envelope.task_id, wire.task_owner.clone(), wire.task_contributors.clone());
        self.runtime.handle_interswarm_response(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_rejects_replays() {
        let mut dedup = Dedup::new(4);
        let id = Uuid::new_v4();
        assert!(dedup.first_sighting(id));
        assert!(!dedup.first_sighting(id));
    }

    #[test]
    fn dedup_evicts_oldest_past_capacity() {
        let mut dedup = Dedup::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert!(dedup.first_sighting(a));
        assert!(dedup.first_sighting(b));
        assert!(dedup.first_sighting(c));
        // `a` was evicted to make room for `c`, so it reads as new again.
        assert!(dedup.first_sighting(a));
    }
}
