//! Wire envelope types. Encoding is JSON; framing is length-prefix (see wire module).

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{DeviceType, NodeId, NodeIdentity};

/// Hop budget given to locally originated messages when the caller does not pick one.
pub const DEFAULT_TTL: u32 = 1000;

/// Every unit exchanged between two nodes.
///
/// Serialized as `{"type": "handshake", "data": {...}}` or `{"type": "message", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope {
    /// Identity announcement, sent once by each side when a connection opens.
    Handshake(Handshake),
    /// Routed application message.
    Message(P2PMessage),
}

/// Identity announcement plus the address the sender can be dialed back on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub node_id: NodeId,
    pub node_name: String,
    pub device_type: DeviceType,
    pub ip: IpAddr,
    pub port: u16,
}

impl Handshake {
    pub fn new(identity: &NodeIdentity, advertised: SocketAddr) -> Self {
        Self {
            node_id: identity.node_id.clone(),
            node_name: identity.node_name.clone(),
            device_type: identity.device_type,
            ip: advertised.ip(),
            port: advertised.port(),
        }
    }

    pub fn advertised_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Originator-assigned message id; the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    pub fn random() -> Self {
        MessageId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_owned())
    }
}

/// How a routed message travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Flooded to every neighbor until it reaches `destination`.
    Broadcast,
    /// Handed to `destination` directly over its neighbor link.
    Dm,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Broadcast => f.write_str("broadcast"),
            MessageKind::Dm => f.write_str("dm"),
        }
    }
}

/// Routed content. Immutable once created: forwarding builds a copy with `ttl - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2PMessage {
    pub id: MessageId,
    /// Remaining hop budget.
    pub ttl: u32,
    pub origin: NodeId,
    pub destination: NodeId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Opaque application payload.
    #[serde(default)]
    pub data: Value,
}

impl P2PMessage {
    /// Hop budget exhausted; must not be processed or transmitted.
    pub fn is_expired(&self) -> bool {
        self.ttl < 1
    }

    /// Copy for the next hop: same id, origin, destination and payload, one hop less.
    pub fn forwarded(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }
}
