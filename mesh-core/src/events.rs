//! Notifications published by the dispatcher to external subscribers.

use std::net::SocketAddr;

use crate::identity::{DeviceType, NodeId};
use crate::neighbors::ConnectionId;
use crate::protocol::{Envelope, P2PMessage};

/// Everything a subscriber can observe about a node.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A transport connection was opened (inbound or outbound).
    Connect { connection_id: ConnectionId },
    /// A transport connection was closed. Emitted exactly once per connection.
    Disconnect { connection_id: ConnectionId },
    /// A peer's handshake arrived; it is now a neighbor.
    NodeConnect {
        node_id: NodeId,
        node_name: String,
        device_type: DeviceType,
        connection_id: ConnectionId,
        /// Address the peer advertised; may be dialed for a reciprocal link.
        addr: SocketAddr,
    },
    /// A neighbor's connection closed.
    NodeDisconnect { node_id: NodeId },
    /// Any envelope decoded from a connection.
    Message {
        connection_id: ConnectionId,
        envelope: Envelope,
    },
    /// A routed message arrived; `node_id` is unknown if the sender has not handshaked.
    NodeMessage {
        node_id: Option<NodeId>,
        message: P2PMessage,
    },
    /// A broadcast addressed to this node. `from` is the neighbor that relayed it last,
    /// `None` when it was originated locally or the relay is unknown.
    Broadcast {
        from: Option<NodeId>,
        message: P2PMessage,
    },
    /// A direct message addressed to this node.
    Dm { origin: NodeId, message: P2PMessage },
}

impl MeshEvent {
    /// Event name as used by external collaborators.
    pub fn name(&self) -> &'static str {
        match self {
            MeshEvent::Connect { .. } => "connect",
            MeshEvent::Disconnect { .. } => "disconnect",
            MeshEvent::NodeConnect { .. } => "node-connect",
            MeshEvent::NodeDisconnect { .. } => "node-disconnect",
            MeshEvent::Message { .. } => "message",
            MeshEvent::NodeMessage { .. } => "node-message",
            MeshEvent::Broadcast { .. } => "broadcast",
            MeshEvent::Dm { .. } => "dm",
        }
    }

    /// Whether this is a local delivery (`broadcast` or `dm`).
    pub fn is_delivery(&self) -> bool {
        matches!(self, MeshEvent::Broadcast { .. } | MeshEvent::Dm { .. })
    }
}
