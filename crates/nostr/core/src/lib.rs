//! Nostr protocol types shared by the relay engine.
//!
//! This crate provides:
//! - NIP-01: Events, REQ filters and the relay wire frames
//! - NIP-77: Negentropy set reconciliation (codec and reconciler)
//!
//! Nothing here touches the network or a runtime; the `nostr-client` crate
//! builds connections, publishing and subscriptions on top of it.

mod event;
mod filter;
mod message;
pub mod negentropy;

pub use event::{
    Event, EventError, EventId, EventTemplate, Signer, UnsignedEvent, compute_id,
    is_ephemeral_kind, sort_events,
};
pub use filter::{EventPredicate, Filter};
pub use message::{ClientMessage, MessageError, RelayMessage, decode_frame, encode_frame};
pub use negentropy::{
    Negentropy, NegentropyConfig, NegentropyError, NegentropyMessage, NegentropyStorage, Record,
};

impl From<&Event> for Record {
    fn from(event: &Event) -> Self {
        Record::new(event.created_at, *event.id.as_bytes())
    }
}
