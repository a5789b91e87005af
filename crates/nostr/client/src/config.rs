//! Configuration types for the relay engine.
//!
//! Every section has working defaults; a JSON document only needs to name
//! the values it overrides. Durations are written as milliseconds.

use crate::endpoint::EndpointId;
use crate::error::{ClientError, Result};
use nostr_core::NegentropyConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    pub link: LinkConfig,
    pub pool: PoolConfig,
    pub outbox: OutboxConfig,
    pub reconciliation: ReconciliationConfig,
    pub subscription: SubscriptionConfig,
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Internal(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }
}

/// Relay connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkConfig {
    /// Connection timeout
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
    /// Initial reconnection delay
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    #[serde(with = "duration_ms")]
    pub max_reconnect_delay: Duration,
    /// Ping interval for health checks
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    /// How long to wait for a pong before declaring the link dead
    #[serde(with = "duration_ms")]
    pub pong_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 0,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// How long an unleased ephemeral endpoint lingers before removal
    #[serde(with = "duration_ms")]
    pub lease_grace: Duration,
    /// Subscriptions kept open per endpoint before new REQs are queued
    pub max_subscriptions_per_endpoint: usize,
    /// Frames buffered per disconnected endpoint
    pub request_queue_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lease_grace: Duration::from_secs(5),
            max_subscriptions_per_endpoint: 14,
            request_queue_limit: 10,
        }
    }
}

/// Publishing has no ack timeout of its own; callers race the flush handle
/// against their own timer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OutboxConfig {
    /// Skip relays that are not writable instead of holding the event for them
    pub drop_unwritable_targets: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconciliationConfig {
    /// Wait for the first NEG-MSG after NEG-OPEN
    #[serde(with = "duration_ms")]
    pub first_response_timeout: Duration,
    /// Wait between later rounds
    #[serde(with = "duration_ms")]
    pub inactivity_timeout: Duration,
    /// Upper bound for a whole session
    #[serde(with = "duration_ms")]
    pub session_timeout: Duration,
    /// How long a relay's negentropy support verdict is trusted
    #[serde(with = "duration_ms")]
    pub support_cache_ttl: Duration,
    /// Ids per REQ when fetching missing events
    pub fetch_batch_size: usize,
    /// Pause between fetch batches
    #[serde(with = "duration_ms")]
    pub fetch_batch_pause: Duration,
    /// Wait for EOSE on each fetch or fallback REQ
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
    pub frame_size_limit: usize,
    pub id_list_threshold: usize,
    pub split_count: usize,
}

impl ReconciliationConfig {
    pub fn negentropy(&self) -> NegentropyConfig {
        NegentropyConfig {
            frame_size_limit: self.frame_size_limit,
            id_list_threshold: self.id_list_threshold,
            split_count: self.split_count,
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            first_response_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(30),
            session_timeout: Duration::from_secs(60),
            support_cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            fetch_batch_size: 500,
            fetch_batch_pause: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(10),
            frame_size_limit: 32 * 1024,
            id_list_threshold: 16,
            split_count: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriptionConfig {
    /// Endpoints queried by network modes; empty means every readable pool member
    pub endpoints: Vec<EndpointId>,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Give up waiting for EOSE from slow relays after this long
    #[serde(with = "duration_ms")]
    pub eose_timeout: Duration,
    /// Bound on acquiring a local-store read transaction
    #[serde(with = "duration_ms")]
    pub local_read_timeout: Duration,
    /// Write events received from relays into the local store
    pub persist_network_events: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            eose_timeout: Duration::from_secs(5),
            local_read_timeout: Duration::from_secs(5),
            persist_network_events: true,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.link.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.pool.max_subscriptions_per_endpoint, 14);
        assert_eq!(config.reconciliation.fetch_batch_size, 500);
        assert!(config.subscription.endpoints.is_empty());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = ClientConfig::from_json_str(
            r#"{
                "pool": { "leaseGrace": 250 },
                "subscription": { "endpoints": ["wss://relay.example.com/"], "eoseTimeout": 1500 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.pool.lease_grace, Duration::from_millis(250));
        assert_eq!(config.pool.request_queue_limit, 10);
        assert_eq!(config.subscription.eose_timeout, Duration::from_millis(1500));
        assert_eq!(
            config.subscription.endpoints[0].as_str(),
            "wss://relay.example.com"
        );
        assert_eq!(config.link, LinkConfig::default());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ClientConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(ClientConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = ClientConfig::from_json_str(r#"{"subscription":{"endpoints":["http://x"]}}"#);
        assert!(matches!(result, Err(ClientError::Serialization(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"link": {{"pingInterval": 5000}}}}"#).unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.link.ping_interval, Duration::from_secs(5));
    }
}
