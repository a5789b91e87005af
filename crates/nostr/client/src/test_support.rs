//! Helpers shared by the unit tests.

use crate::config::{LinkConfig, PoolConfig};
use crate::memory::{MemoryRelay, MemoryTransport};
use crate::pool::{ConnectionPool, PoolEvent, PoolEvents};
use nostr_core::{Event, compute_id};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// An unsigned-but-well-formed event with a correct id.
pub(crate) fn event(created_at: u64, kind: u16, content: &str) -> Event {
    let pubkey = "ab".repeat(32);
    Event {
        id: compute_id(&pubkey, created_at, kind, &[], content).unwrap(),
        pubkey,
        created_at,
        kind,
        tags: vec![],
        content: content.to_string(),
        sig: "00".repeat(64),
    }
}

/// Pool with short reconnect and grace timings.
pub(crate) fn fast_pool(transport: &MemoryTransport) -> ConnectionPool {
    let link = LinkConfig {
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_delay: Duration::from_millis(100),
        connect_timeout: Duration::from_millis(200),
        ..LinkConfig::default()
    };
    let config = PoolConfig {
        lease_grace: Duration::from_millis(100),
        ..PoolConfig::default()
    };
    ConnectionPool::new(Arc::new(transport.clone()), link, config)
}

/// Register a fresh relay at `url` with the transport.
pub(crate) fn relay(transport: &MemoryTransport, url: &str) -> MemoryRelay {
    let relay = MemoryRelay::with_url(url).unwrap();
    transport.add_relay(relay.clone());
    relay
}

/// Collect `count` pool events matching `pred`, skipping the rest.
pub(crate) async fn wait_for(
    events: &mut PoolEvents,
    count: usize,
    pred: impl Fn(&PoolEvent) -> bool,
) -> Vec<PoolEvent> {
    let mut matched = Vec::new();
    while matched.len() < count {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("pool event timed out")
            .expect("pool events closed");
        if pred(&event) {
            matched.push(event);
        }
    }
    matched
}
