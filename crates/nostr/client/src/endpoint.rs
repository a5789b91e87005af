//! Relay endpoint identity and pool membership descriptors.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// Normalized relay URL. Two spellings of the same relay compare equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Arc<str>);

impl EndpointId {
    /// Parse and normalize a relay URL.
    ///
    /// The scheme must be `ws` or `wss`. Scheme and host are lowercased, the
    /// fragment is dropped and a bare trailing slash is removed.
    pub fn parse(input: &str) -> Result<Self> {
        let mut url = Url::parse(input.trim())?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ClientError::InvalidUrl(format!("missing host in {}", input)));
        }

        url.set_fragment(None);
        let mut normalized = url.to_string();
        if url.path() == "/" && url.query().is_none() {
            normalized.pop();
        }
        Ok(Self(normalized.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn url(&self) -> Result<Url> {
        Ok(Url::parse(&self.0)?)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EndpointId({})", self.0)
    }
}

impl FromStr for EndpointId {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for EndpointId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EndpointId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Which kinds of frames an endpoint is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadWriteMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl ReadWriteMode {
    pub fn can_read(self) -> bool {
        matches!(self, ReadWriteMode::ReadWrite | ReadWriteMode::ReadOnly)
    }

    pub fn can_write(self) -> bool {
        matches!(self, ReadWriteMode::ReadWrite | ReadWriteMode::WriteOnly)
    }
}

/// How long an endpoint stays in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Never removed automatically.
    Persistent,
    /// Kept while at least one lease is held.
    Ephemeral { leases: u32 },
}

impl Lifetime {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Lifetime::Ephemeral { .. })
    }
}

/// Pool membership record for one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub id: EndpointId,
    pub read_write: ReadWriteMode,
    pub lifetime: Lifetime,
}

impl EndpointDescriptor {
    pub fn persistent(id: EndpointId) -> Self {
        Self {
            id,
            read_write: ReadWriteMode::ReadWrite,
            lifetime: Lifetime::Persistent,
        }
    }

    /// An ephemeral descriptor starts with no leases.
    pub fn ephemeral(id: EndpointId) -> Self {
        Self {
            id,
            read_write: ReadWriteMode::ReadWrite,
            lifetime: Lifetime::Ephemeral { leases: 0 },
        }
    }

    pub fn with_mode(mut self, read_write: ReadWriteMode) -> Self {
        self.read_write = read_write;
        self
    }

    pub fn leases(&self) -> Option<u32> {
        match self.lifetime {
            Lifetime::Persistent => None,
            Lifetime::Ephemeral { leases } => Some(leases),
        }
    }
}
