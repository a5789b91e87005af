//! Nostr relay message types.
//!
//! This module implements the relay protocol frames from NIP-01 and NIP-77:
//! - Client to Relay: EVENT, REQ, CLOSE, NEG-OPEN, NEG-MSG, NEG-CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH, NEG-MSG, NEG-ERR
//!
//! Both directions can be encoded and decoded so the same types serve the
//! client engine and in-process test relays.

use crate::event::{Event, EventId};
use crate::filter::Filter;
use serde_json::{Value, json};
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },

    /// Open a reconciliation session: ["NEG-OPEN", <subscription_id>, <filter>, <hex message>]
    NegOpen {
        subscription_id: String,
        filter: Filter,
        message: String,
    },

    /// Continue a reconciliation session: ["NEG-MSG", <subscription_id>, <hex message>]
    NegMsg {
        subscription_id: String,
        message: String,
    },

    /// End a reconciliation session: ["NEG-CLOSE", <subscription_id>]
    NegClose { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientMessage::NegOpen {
                subscription_id,
                filter,
                message,
            } => json!(["NEG-OPEN", subscription_id, filter, message]),
            ClientMessage::NegMsg {
                subscription_id,
                message,
            } => json!(["NEG-MSG", subscription_id, message]),
            ClientMessage::NegClose { subscription_id } => json!(["NEG-CLOSE", subscription_id]),
        };
        Ok(value.to_string())
    }

    /// Parse a client frame (used by relays and test doubles).
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr = parse_array(json)?;
        let msg_type = frame_type(&arr)?;

        match msg_type {
            "EVENT" => {
                let event = arr
                    .get(1)
                    .ok_or_else(|| MessageError::MissingField("event".to_string()))?;
                Ok(ClientMessage::Event(serde_json::from_value(event.clone())?))
            }
            "REQ" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let filters = arr[2..]
                    .iter()
                    .map(|f| serde_json::from_value(f.clone()))
                    .collect::<Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "NEG-OPEN" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let filter = arr
                    .get(2)
                    .ok_or_else(|| MessageError::MissingField("filter".to_string()))?;
                let filter: Filter = serde_json::from_value(filter.clone())?;
                let message = string_at(&arr, 3, "message")?;
                Ok(ClientMessage::NegOpen {
                    subscription_id,
                    filter,
                    message,
                })
            }
            "NEG-MSG" => Ok(ClientMessage::NegMsg {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                message: string_at(&arr, 2, "message")?,
            }),
            "NEG-CLOSE" => Ok(ClientMessage::NegClose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            _ => Err(MessageError::UnknownType(msg_type.to_string())),
        }
    }

    /// Frames that read from a relay (as opposed to publishing to it).
    pub fn is_read(&self) -> bool {
        !matches!(self, ClientMessage::Event(_))
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: EventId,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },

    /// Authentication challenge (NIP-42): ["AUTH", <challenge>]
    Auth { challenge: String },

    /// Reconciliation round: ["NEG-MSG", <subscription_id>, <hex message>]
    NegMsg {
        subscription_id: String,
        message: String,
    },

    /// Reconciliation refused or aborted: ["NEG-ERR", <subscription_id>, <reason>]
    NegErr {
        subscription_id: String,
        reason: String,
    },
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr = parse_array(json)?;
        let msg_type = frame_type(&arr)?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField(
                        "event or subscription_id".to_string(),
                    ));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let event: Event = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField("OK fields".to_string()));
                }
                let event_id = string_at(&arr, 1, "event_id")?;
                let event_id = EventId::from_hex(&event_id)
                    .map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
                let success = arr[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("success not a boolean".to_string())
                })?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                message: arr.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(&arr, 1, "challenge")?,
            }),
            "NEG-MSG" => Ok(RelayMessage::NegMsg {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                message: string_at(&arr, 2, "message")?,
            }),
            "NEG-ERR" => Ok(RelayMessage::NegErr {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                reason: arr.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
            }),
            _ => Err(MessageError::UnknownType(msg_type.to_string())),
        }
    }

    /// Serialize to a JSON array (used by relays and test doubles).
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event]),
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => json!(["OK", event_id, success, message]),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
            RelayMessage::Notice { message } => json!(["NOTICE", message]),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]),
            RelayMessage::NegMsg {
                subscription_id,
                message,
            } => json!(["NEG-MSG", subscription_id, message]),
            RelayMessage::NegErr {
                subscription_id,
                reason,
            } => json!(["NEG-ERR", subscription_id, reason]),
        };
        Ok(value.to_string())
    }

    /// The subscription this frame is addressed to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            }
            | RelayMessage::NegMsg {
                subscription_id, ..
            }
            | RelayMessage::NegErr {
                subscription_id, ..
            } => Some(subscription_id),
            RelayMessage::Ok { .. } | RelayMessage::Notice { .. } | RelayMessage::Auth { .. } => {
                None
            }
        }
    }
}

/// Encode a client frame for the wire.
pub fn encode_frame(message: &ClientMessage) -> Result<String, MessageError> {
    message.to_json()
}

/// Decode a relay frame from the wire.
pub fn decode_frame(text: &str) -> Result<RelayMessage, MessageError> {
    RelayMessage::from_json(text)
}

fn parse_array(json: &str) -> Result<Vec<Value>, MessageError> {
    let arr: Vec<Value> =
        serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;
    if arr.is_empty() {
        return Err(MessageError::InvalidFormat("empty array".to_string()));
    }
    Ok(arr)
}

fn frame_type(arr: &[Value]) -> Result<&str, MessageError> {
    arr[0]
        .as_str()
        .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    let value = arr
        .get(index)
        .ok_or_else(|| MessageError::MissingField(field.to_string()))?;
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}
