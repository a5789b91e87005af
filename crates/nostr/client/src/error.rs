//! Client error types

use crate::endpoint::EndpointId;
use nostr_core::{EventError, EventId, MessageError, NegentropyError};
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected to relay {0}")]
    NotConnected(EndpointId),

    /// Endpoint already in the pool
    #[error("Endpoint already exists: {0}")]
    AlreadyExists(EndpointId),

    /// Lookup of an endpoint, outbox entry or subscription failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Negative acknowledgement from a relay
    #[error("Relay {endpoint} rejected {event_id}: {message}")]
    Ack {
        endpoint: EndpointId,
        event_id: EventId,
        message: String,
    },

    /// Local store accessed after shutdown
    #[error("Local event store is closed")]
    StoreClosed,

    /// Reconciliation session stalled
    #[error("Reconciliation with {endpoint} timed out")]
    ReconciliationTimeout { endpoint: EndpointId },

    /// Relay refused or broke the reconciliation protocol
    #[error("Reconciliation with {endpoint} unsupported: {reason}")]
    ReconciliationUnsupported { endpoint: EndpointId, reason: String },

    /// Inbound frame for a subscription nobody is listening to
    #[error("No handler for subscription {subscription_id}")]
    SubscriptionMismatch { subscription_id: String },

    /// Pool has been closed
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Wire message error
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Event error
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// Negentropy codec error
    #[error("Negentropy error: {0}")]
    Negentropy(#[from] NegentropyError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Transport-level failures that are retried with backoff.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::WebSocket(_)
                | ClientError::Connection(_)
                | ClientError::Timeout(_)
                | ClientError::NotConnected(_)
        )
    }
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
