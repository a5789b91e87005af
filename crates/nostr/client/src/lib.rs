//! Nostr relay client engine.
//!
//! This crate provides:
//! - [`ConnectionLink`]: one reconnecting WebSocket per relay with ping liveness
//! - [`ConnectionPool`]: lease-counted relay membership and subscription routing
//! - [`Outbox`]: reliable publishing with per-relay acknowledgement tracking
//! - [`ReconciliationAdapter`]: NIP-77 negentropy sync with REQ fallback
//! - [`SubscriptionEngine`]: one deduplicated stream over the local store and relays
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_client::{
//!     ClientConfig, ConnectionPool, Filter, Optimization, StoreGate, StreamItem, StreamMode,
//!     SubscriptionEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let mut config = ClientConfig::default();
//!     config.subscription.endpoints = vec!["wss://relay.damus.io".parse()?];
//!
//!     let pool = ConnectionPool::websocket(&config);
//!     let store = Arc::new(StoreGate::memory(config.subscription.local_read_timeout));
//!     let engine = SubscriptionEngine::new(pool, store, &config);
//!
//!     let filter = Filter::new().kinds(vec![1]).limit(10);
//!     let mut stream = engine.advanced_stream(
//!         vec![filter],
//!         StreamMode::LocalAndNetworkParallel(Optimization::Reconciliation),
//!         None,
//!     );
//!     while let Some(item) = stream.recv().await {
//!         match item {
//!             StreamItem::Event(event) => event.borrow(|e| println!("{}", e.content)),
//!             StreamItem::LocalEose => println!("-- end of local events --"),
//!             other => println!("{:?}", other),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod backoff;
mod config;
mod endpoint;
mod engine;
mod error;
mod link;
pub mod memory;
mod outbox;
mod pool;
mod reconciliation;
mod store;
mod subscription;
mod transport;

#[cfg(test)]
mod test_support;

pub use backoff::{ExponentialBackoff, Jitter};
pub use config::{
    ClientConfig, LinkConfig, OutboxConfig, PoolConfig, ReconciliationConfig, SubscriptionConfig,
};
pub use endpoint::{EndpointDescriptor, EndpointId, Lifetime, ReadWriteMode};
pub use engine::{
    AdvancedStream, CloseReason, EventLender, Optimization, StreamItem, StreamMode,
    SubscriptionEngine,
};
pub use error::{ClientError, Result};
pub use link::{ConnectionLink, LinkEvent, LinkState};
pub use outbox::{
    AckResult, FlushCallback, FlushHandle, FlushOutcome, FlushReport, Outbox, OutboxEntrySnapshot,
    SendOptions,
};
pub use pool::{
    ConnectionPool, LeaseGuard, PoolEvent, PoolEvents, PoolSubscription, RelayNotification,
};
pub use reconciliation::{
    ReconcileReport, ReconciliationAdapter, ReconciliationResult, Support, SupportCache,
    SyncSummary,
};
pub use store::{
    EventStore, LiveEvents, MemoryEventStore, MemoryStoreConfig, StoreGate, is_addressable_kind,
    is_replaceable_kind,
};
pub use subscription::{EoseTracker, generate_subscription_id, prefixed_subscription_id};
pub use transport::{FrameSink, FrameStream, Socket, Transport, WebSocketTransport, WireFrame};

pub use nostr_core::{ClientMessage, Event, EventId, EventTemplate, Filter, RelayMessage, Signer};
