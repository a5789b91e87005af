//! NIP-01 events.
//!
//! The engine treats most event fields as opaque: it routes on the id,
//! orders on `created_at`, and hands everything else through untouched.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("event id mismatch: claimed {claimed}, computed {computed}")]
    IdMismatch { claimed: EventId, computed: EventId },

    #[error("signing error: {0}")]
    Signing(String),
}

/// 32-byte sha256 content identifier of an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventId([u8; 32]);

impl EventId {
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Build an id from a slice, rejecting anything that is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EventError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| EventError::InvalidLength {
            expected: Self::LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, EventError> {
        let bytes = hex::decode(hex_str).map_err(|e| EventError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", &self.to_hex()[..16])
    }
}

impl FromStr for EventId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for EventId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// sha256 of the serialized event data
    pub id: EventId,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Recompute the id from the event fields and compare it with the claimed one.
    pub fn verify_id(&self) -> Result<(), EventError> {
        let computed = compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if computed != self.id {
            return Err(EventError::IdMismatch {
                claimed: self.id,
                computed,
            });
        }
        Ok(())
    }

    /// Values of every tag named `name` (the second element of each matching tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    pub fn is_ephemeral(&self) -> bool {
        is_ephemeral_kind(self.kind)
    }
}

/// An event that has an author but no signature yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn id(&self) -> Result<EventId, EventError> {
        compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// Attach a signature produced elsewhere.
    pub fn into_signed(self, sig: String) -> Result<Event, EventError> {
        let id = self.id()?;
        Ok(Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        })
    }
}

/// A template for creating events (without pubkey, which comes from the signer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    pub fn to_unsigned(&self, pubkey: impl Into<String>) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: pubkey.into(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// Produces signed events. Key material never passes through the engine.
pub trait Signer: Send + Sync {
    /// Hex-encoded public key events are signed with.
    fn public_key(&self) -> String;

    /// Sign an unsigned event.
    fn sign(&self, event: UnsignedEvent) -> Result<Event, EventError>;

    fn sign_template(&self, template: &EventTemplate) -> Result<Event, EventError> {
        self.sign(template.to_unsigned(self.public_key()))
    }
}

/// Compute the NIP-01 id: sha256 of `[0, pubkey, created_at, kind, tags, content]`.
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<EventId, EventError> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))
        .map_err(|e| EventError::Serialization(e.to_string()))?;
    let hash = Sha256::digest(serialized.as_bytes());
    EventId::from_slice(&hash)
}

/// Check if a kind is ephemeral (20000 <= n < 30000).
pub fn is_ephemeral_kind(kind: u16) -> bool {
    (20000..30000).contains(&kind)
}

/// Sort events in reverse-chronological order by created_at,
/// then by id in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(content: &str, created_at: u64) -> Event {
        UnsignedEvent {
            pubkey: "a".repeat(64),
            created_at,
            kind: 1,
            tags: vec![vec!["e".to_string(), "abc".to_string()]],
            content: content.to_string(),
        }
        .into_signed("0".repeat(128))
        .unwrap()
    }

    #[test]
    fn test_event_id_hex_roundtrip() {
        let id = EventId::from_bytes([7u8; 32]);
        let parsed: EventId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_event_id_rejects_short_input() {
        match EventId::from_hex("abcd") {
            Err(EventError::InvalidLength { expected, actual }) => {
                assert_eq!(expected, 32);
                assert_eq!(actual, 2);
            }
            other => panic!("Expected InvalidLength, got {:?}", other),
        }
    }

    #[test]
    fn test_event_json_uses_hex_id() {
        let event = note("hello", 100);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"].as_str().unwrap(), event.id.to_hex());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_verify_id_detects_tampering() {
        let mut event = note("hello", 100);
        assert!(event.verify_id().is_ok());

        event.content = "tampered".to_string();
        assert!(matches!(event.verify_id(), Err(EventError::IdMismatch { .. })));
    }

    #[test]
    fn test_tag_values() {
        let event = note("hello", 100);
        assert_eq!(event.tag_values("e").collect::<Vec<_>>(), vec!["abc"]);
        assert_eq!(event.tag_values("p").count(), 0);
    }

    #[test]
    fn test_sort_events_newest_first() {
        let mut events = vec![note("a", 1), note("b", 3), note("c", 2)];
        sort_events(&mut events);
        let stamps: Vec<u64> = events.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![3, 2, 1]);
    }

    #[test]
    fn test_ephemeral_kinds() {
        assert!(is_ephemeral_kind(20001));
        assert!(!is_ephemeral_kind(1));
        assert!(!is_ephemeral_kind(30000));
    }
}
