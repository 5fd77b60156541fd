//! Swarm registry: the address book of known peer swarms.
//!
//! Grounded in the teacher crate's `http_client_pool.rs` (the `DashMap`
//! connection-pool variant, not the `Mutex<HashMap>` one in `http_pool.rs`)
//! — concurrent reads dominate here (every outbound envelope resolves a
//! peer's base URL) so a lock-free map fits better than a single mutex
//! around a `HashMap`.

use crate::mail::error::RouterError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// A known peer swarm. `persistent` entries survive `save`/`load`;
/// `discover`-ed entries are volatile and live only for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEntry {
    pub name: String,
    pub base_url: String,
    /// Defaults to `{base_url}/health` if not given explicitly.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Either a literal token (volatile entries only) or a `${VAR_NAME}`
    /// reference resolved from the environment at send time (persistent
    /// entries). `None` falls back to the legacy `auth_env_var(name)` lookup,
    /// e.g. for peers that were never explicitly `register()`-ed.
    #[serde(default)]
    pub auth_token_ref: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub persistent: bool,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

/// `SWARM_AUTH_TOKEN_<PEER_UPPER>` — the shared-secret env var this process
/// reads to authenticate itself to (and verify requests claiming to be from)
/// `peer_swarm`.
pub fn auth_env_var(peer_swarm: &str) -> String {
    format!("SWARM_AUTH_TOKEN_{}", peer_swarm.to_uppercase().replace('-', "_"))
}

/// Digest-based comparison so a timing attack can't binary-search a token
/// byte by byte, even when `expected`/`provided` differ in length.
pub fn constant_time_token_eq(expected: &str, provided: &str) -> bool {
    let e = Sha256::digest(expected.as_bytes());
    let p = Sha256::digest(provided.as_bytes());
    e.ct_eq(&p).into()
}

#[derive(Serialize, Deserialize)]
struct PersistedRegistry {
    entries: Vec<SwarmEntry>,
}

/// Concurrent map of peer swarms plus a background health-check loop.
pub struct SwarmRegistry {
    entries: DashMap<String, SwarmEntry>,
    http: reqwest::Client,
    persistence_path: Option<PathBuf>,
    health_check_interval: Duration,
    health_check_failure_threshold: u32,
    health_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl SwarmRegistry {
    pub fn new(health_check_interval: Duration, health_check_failure_threshold: u32) -> Self {
        Self {
            entries: DashMap::new(),
            http: reqwest::Client::new(),
            persistence_path: None,
            health_check_interval,
            health_check_failure_threshold,
            health_task: AsyncMutex::new(None),
        }
    }

    pub fn with_persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = Some(path.into());
        self
    }

    /// Registers (or replaces) a peer swarm. `token`, if given, is only
    /// stored as a literal `auth_token_ref` for a volatile (`persistent =
    /// false`) entry, per spec's secret-handling rule; for a persistent
    /// entry it is instead turned into a generated `${SWARM_AUTH_TOKEN_...}`
    /// reference so the raw secret is never written to the persistence file.
    pub fn register(
        &self,
        name: impl Into<String>,
        base_url: impl Into<String>,
        persistent: bool,
        token: Option<String>,
        health_url: Option<String>,
    ) {
        let name = name.into();
        let base_url = base_url.into();
        let auth_token_ref = if persistent {
            token.map(|_| format!("${{{}}}", auth_env_var(&name)))
        } else {
            token
        };
        let health_url = health_url.unwrap_or_else(|| format!("{}/health", base_url.trim_end_matches('/')));
        self.entries.insert(
            name.clone(),
            SwarmEntry {
                name,
                base_url,
                health_url: Some(health_url),
                auth_token_ref,
                metadata: serde_json::Map::new(),
                persistent,
                healthy: true,
                consecutive_failures: 0,
                last_seen: None,
            },
        );
    }

    /// Resolves the bearer token for `peer_swarm`. A registered entry's
    /// `auth_token_ref` wins, whether literal (volatile) or a `${VAR}`
    /// reference (persistent); otherwise falls back to the legacy
    /// peer-keyed `auth_env_var` convention, which also covers peers that
    /// were never explicitly `register()`-ed but have a token set purely via
    /// the environment.
    pub fn resolve_token(&self, peer_swarm: &str) -> Result<String, RouterError> {
        if let Some(entry) = self.entries.get(peer_swarm) {
            if let Some(token_ref) = &entry.auth_token_ref {
                return match token_ref.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
                    Some(var) => std::env::var(var).map_err(|_| RouterError::MissingAuthToken { env_var: var.to_string() }),
                    None => Ok(token_ref.clone()),
                };
            }
        }
        let var = auth_env_var(peer_swarm);
        std::env::var(&var).map_err(|_| RouterError::MissingAuthToken { env_var: var })
    }

    pub fn unregister(&self, name: &str) -> Option<SwarmEntry> {
        self.entries.remove(name).map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<SwarmEntry> {
        self.entries.iter().map(|r| r.value().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<SwarmEntry> {
        self.entries.get(name).map(|r| r.value().clone())
    }

    /// Fetches a peer directory from `url` (expected to serve a JSON array of
    /// `{name, base_url}`) and registers each as a volatile entry.
    pub async fn discover(&self, url: &str) -> Result<usize, RouterError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| RouterError::UnreachablePeer {
                swarm: url.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(RouterError::NonSuccessStatus {
                swarm: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        #[derive(Deserialize)]
        struct Peer {
            name: String,
            base_url: String,
        }
        let peers: Vec<Peer> = response
            .json()
            .await
            .map_err(|e| RouterError::UnreachablePeer {
                swarm: url.to_string(),
                reason: e.to_string(),
            })?;
        let count = peers.len();
        for peer in peers {
            self.register(peer.name, peer.base_url, false, None, None);
        }
        Ok(count)
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        let entries: Vec<SwarmEntry> = self
            .entries
            .iter()
            .filter(|r| r.value().persistent)
            .map(|r| r.value().clone())
            .collect();
        let json = serde_json::to_string_pretty(&PersistedRegistry { entries })?;
        std::fs::write(path, json)
    }

    pub fn load(&self) -> std::io::Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !Path::new(path).exists() {
            return Ok(());
        }
        let json = std::fs::read_to_string(path)?;
        let persisted: PersistedRegistry = serde_json::from_str(&json)?;
        for entry in persisted.entries {
            self.entries.insert(entry.name.clone(), entry);
        }
        Ok(())
    }

    /// Spawns a background poll of every registered peer's health endpoint.
    /// Idempotent: calling twice without an intervening `stop_health` is a
    /// no-op on the second call.
    pub async fn start_health(self: &Arc<Self>) {
        let mut guard = self.health_task.lock().await;
        if guard.is_some() {
            return;
        }
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.health_check_interval);
            loop {
                ticker.tick().await;
                registry.poll_once().await;
            }
        });
        *guard = Some(handle);
    }

    pub async fn stop_health(&self) {
        let mut guard = self.health_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }

    async fn poll_once(&self) {
        let names: Vec<String> = self.entries.iter().map(|r| r.key().clone()).collect();
        for name in names {
            let Some(url) = self.entries.get(&name).map(|e| {
                e.health_url
                    .clone()
                    .unwrap_or_else(|| format!("{}/health", e.base_url.trim_end_matches('/')))
            }) else {
                continue;
            };
            let ok = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if let Some(mut entry) = self.entries.get_mut(&name) {
                if ok {
                    entry.healthy = true;
                    entry.consecutive_failures = 0;
                    entry.last_seen = Some(Utc::now());
                } else {
                    entry.consecutive_failures += 1;
                    if entry.consecutive_failures >= self.health_check_failure_threshold {
                        entry.healthy = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_tokens() {
        assert!(constant_time_token_eq("secret", "secret"));
        assert!(!constant_time_token_eq("secret", "other"));
        assert!(!constant_time_token_eq("short", "a-much-longer-token-value"));
    }

    #[test]
    fn auth_env_var_normalizes_name() {
        assert_eq!(auth_env_var("swarm-b"), "SWARM_AUTH_TOKEN_SWARM_B");
    }

    #[test]
    fn register_and_list_round_trip() {
        let registry = SwarmRegistry::new(Duration::from_secs(30), 3);
        registry.register("peer-a", "https://peer-a.example", true, None, None);
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "peer-a");
        assert!(listed[0].persistent);
        assert_eq!(listed[0].health_url.as_deref(), Some("https://peer-a.example/health"));
    }

    #[test]
    fn register_with_literal_token_only_kept_for_volatile_entries() {
        let registry = SwarmRegistry::new(Duration::from_secs(30), 3);
        registry.register("peer-b", "https://peer-b.example", false, Some("literal-secret".to_string()), None);
        let entry = registry.get("peer-b").unwrap();
        assert_eq!(entry.auth_token_ref.as_deref(), Some("literal-secret"));

        registry.register(
            "peer-c",
            "https://peer-c.example",
            true,
            Some("literal-secret".to_string()),
            None,
        );
        let entry = registry.get("peer-c").unwrap();
        assert_eq!(entry.auth_token_ref.as_deref(), Some("${SWARM_AUTH_TOKEN_PEER_C}"));
    }
}
