//! Integration tests for the client engine against in-process relays.
//!
//! Every relay here is a `MemoryRelay` reached through `MemoryTransport`, so
//! the tests exercise the real link, pool, outbox and engine code without
//! opening sockets.

mod outbox;
mod pool;
mod streams;

use nostr_client::memory::{MemoryRelay, MemoryTransport};
use nostr_client::{
    ClientConfig, ConnectionPool, EndpointDescriptor, Event, EventTemplate, LinkConfig,
    PoolConfig, Signer,
};
use nostr_core::{EventError, UnsignedEvent};
use std::sync::{Arc, Once};
use std::time::Duration;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Signs with a fixed key and a dummy signature; ids are real.
pub struct TestSigner;

impl Signer for TestSigner {
    fn public_key(&self) -> String {
        "5e".repeat(32)
    }

    fn sign(&self, event: UnsignedEvent) -> Result<Event, EventError> {
        event.into_signed("00".repeat(64))
    }
}

pub fn note(created_at: u64, content: &str) -> Event {
    kind_event(created_at, 1, content)
}

pub fn kind_event(created_at: u64, kind: u16, content: &str) -> Event {
    TestSigner
        .sign_template(&EventTemplate {
            created_at,
            kind,
            tags: vec![],
            content: content.to_string(),
        })
        .unwrap()
}

/// A transport with one relay per url.
pub fn network(urls: &[&str]) -> (MemoryTransport, Vec<MemoryRelay>) {
    init_tracing();
    let transport = MemoryTransport::new();
    let relays = urls
        .iter()
        .map(|url| {
            let relay = MemoryRelay::with_url(url).unwrap();
            transport.add_relay(relay.clone());
            relay
        })
        .collect();
    (transport, relays)
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        link: LinkConfig {
            connect_timeout: Duration::from_millis(300),
            reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(100),
            ..LinkConfig::default()
        },
        pool: PoolConfig {
            lease_grace: Duration::from_millis(100),
            ..PoolConfig::default()
        },
        ..ClientConfig::default()
    }
}

pub fn pool(transport: &MemoryTransport, config: &ClientConfig) -> ConnectionPool {
    ConnectionPool::from_config(Arc::new(transport.clone()), config)
}

/// A pool with every relay added as a persistent member.
pub fn member_pool(
    transport: &MemoryTransport,
    config: &ClientConfig,
    relays: &[MemoryRelay],
) -> ConnectionPool {
    let pool = pool(transport, config);
    for relay in relays {
        pool.add_endpoint(EndpointDescriptor::persistent(relay.endpoint()))
            .unwrap();
    }
    pool
}
