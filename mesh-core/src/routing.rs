//! Flooding engine: deliver locally, forward, or drop.
//!
//! Broadcasts flood to every neighbor (the sender included); the seen set is the only loop
//! guard. DMs go straight to the destination's neighbor link. Inbound messages are forwarded
//! with `ttl - 1`; locally originated ones leave with their initial budget. Both paths share
//! [`Router::fan_out`].

use serde::{Deserialize, Serialize};

use crate::dedup::SeenSet;
use crate::identity::NodeId;
use crate::neighbors::{ConnectionId, NeighborDirectory};
use crate::protocol::{MessageKind, P2PMessage};

/// What to do with a DM whose destination is not a neighbor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmRouting {
    /// Drop it. Delivery only works between directly connected nodes.
    #[default]
    Direct,
    /// Flood it toward the destination like a broadcast; DM ids are deduplicated too.
    Flood,
}

/// Outcome of routing a single message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Addressed to this node.
    Deliver(P2PMessage),
    /// Transmit `message` on each of `targets`.
    Forward {
        message: P2PMessage,
        targets: Vec<ConnectionId>,
    },
    Drop(DropReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Hop budget exhausted.
    Expired,
    /// Id already delivered or forwarded.
    Duplicate,
    /// DM destination is not a neighbor.
    Unreachable(NodeId),
    /// Nothing to flood to.
    NoNeighbors,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::Expired => f.write_str("ttl exhausted"),
            DropReason::Duplicate => f.write_str("duplicate id"),
            DropReason::Unreachable(node) => write!(f, "{} is not a neighbor", node),
            DropReason::NoNeighbors => f.write_str("no neighbors"),
        }
    }
}

#[derive(Debug)]
pub struct Router {
    local: NodeId,
    seen: SeenSet,
    dm_routing: DmRouting,
}

impl Router {
    pub fn new(local: NodeId, seen: SeenSet, dm_routing: DmRouting) -> Self {
        Self {
            local,
            seen,
            dm_routing,
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Route a message received from a neighbor.
    pub fn route_inbound(&mut self, message: P2PMessage, neighbors: &NeighborDirectory) -> Decision {
        if message.is_expired() {
            return Decision::Drop(DropReason::Expired);
        }
        if self.deduplicates(message.kind) && !self.seen.insert(&message.id) {
            return Decision::Drop(DropReason::Duplicate);
        }
        if message.destination == self.local {
            return Decision::Deliver(message);
        }
        self.fan_out(message.forwarded(), neighbors)
    }

    /// Route a message created on this node.
    pub fn originate(&mut self, message: P2PMessage, neighbors: &NeighborDirectory) -> Decision {
        if message.is_expired() {
            return Decision::Drop(DropReason::Expired);
        }
        if self.deduplicates(message.kind) {
            self.seen.insert(&message.id);
        }
        if message.destination == self.local {
            return Decision::Deliver(message);
        }
        self.fan_out(message, neighbors)
    }

    /// Pick the links `message` leaves on. Never transmits an expired message.
    pub fn fan_out(&self, message: P2PMessage, neighbors: &NeighborDirectory) -> Decision {
        if message.is_expired() {
            return Decision::Drop(DropReason::Expired);
        }
        let targets = match message.kind {
            MessageKind::Broadcast => neighbors.connections(),
            MessageKind::Dm => match neighbors.connection_of(&message.destination) {
                Some(conn) => vec![conn],
                None if self.dm_routing == DmRouting::Flood => neighbors.connections(),
                None => {
                    return Decision::Drop(DropReason::Unreachable(message.destination.clone()))
                }
            },
        };
        if targets.is_empty() {
            return Decision::Drop(DropReason::NoNeighbors);
        }
        Decision::Forward { message, targets }
    }

    fn deduplicates(&self, kind: MessageKind) -> bool {
        match kind {
            MessageKind::Broadcast => true,
            MessageKind::Dm => self.dm_routing == DmRouting::Flood,
        }
    }
}
