//! Configuration for the MAIL runtime.
//!
//! Mirrors the teacher crate's minimal, field-literal `CloudLLMConfig`: users
//! construct this by hand or via `MailConfig::default()`. No file-format
//! parsing dependency is introduced.
//!
//! # Example
//!
//! ```rust
//! use mail::MailConfig;
//!
//! let config = MailConfig::default();
//! assert_eq!(config.local_swarm_name, "local");
//!
//! let config = MailConfig {
//!     local_swarm_name: "alpha".to_string(),
//!     ..MailConfig::default()
//! };
//! assert_eq!(config.local_swarm_name, "alpha");
//! ```

use std::time::Duration;

/// Global configuration for a [`Runtime`](crate::runtime::Runtime) and the
/// [`Router`](crate::router::Router)/[`SwarmRegistry`](crate::registry::SwarmRegistry)
/// it is wired to.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Name this swarm instance is known as to peers (used to detect remote
    /// recipients and to stamp `source_swarm` on outbound envelopes).
    pub local_swarm_name: String,

    /// Minimum number of events retained per task in the bounded ring buffer.
    pub event_ring_capacity: usize,

    /// Default wall-clock bound for `submit_and_wait`/`submit_and_stream`
    /// when the caller does not supply one.
    pub default_submit_timeout: Duration,

    /// Heartbeat interval for open event streams.
    pub stream_ping_interval: Duration,

    /// Grace period `shutdown()` waits for in-flight tasks before cancelling
    /// the remainder.
    pub shutdown_grace_period: Duration,

    /// Interval at which the registry polls peer health endpoints.
    pub health_check_interval: Duration,

    /// Consecutive health-check failures before a peer is marked inactive.
    pub health_check_failure_threshold: u32,

    /// Default timeout for outbound inter-swarm HTTP calls.
    pub router_request_timeout: Duration,

    /// Maximum number of recently-seen inter-swarm `message_id`s the router
    /// remembers for idempotent-redelivery detection.
    pub router_dedup_capacity: usize,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            local_swarm_name: "local".to_string(),
            event_ring_capacity: 1000,
            default_submit_timeout: Duration::from_secs(120),
            stream_ping_interval: Duration::from_secs(15),
            shutdown_grace_period: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_check_failure_threshold: 3,
            router_request_timeout: Duration::from_secs(60),
            router_dedup_capacity: 4096,
        }
    }
}
