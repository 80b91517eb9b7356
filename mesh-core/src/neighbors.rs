//! Neighbor directory: which node is reachable over which live connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::identity::{DeviceType, NodeId};

/// Locally allocated connection handle. Unique per process, meaningless across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_raw(raw: u64) -> Self {
        ConnectionId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A node directly reachable over an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub connection_id: ConnectionId,
    pub node_name: String,
    pub device_type: DeviceType,
    /// Address the neighbor advertised in its handshake.
    pub addr: SocketAddr,
}

/// NodeId -> Neighbor, with a reverse index by connection.
///
/// At most one entry per node and one node per connection. A fresh handshake for a known
/// node replaces the older entry.
#[derive(Debug, Default)]
pub struct NeighborDirectory {
    by_node: HashMap<NodeId, Neighbor>,
    by_connection: HashMap<ConnectionId, NodeId>,
}

impl NeighborDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `node_id` as reachable. Returns the entry it replaced, if any.
    pub fn insert(&mut self, node_id: NodeId, neighbor: Neighbor) -> Option<Neighbor> {
        // The connection may previously have announced a different node id.
        if let Some(old_node) = self.by_connection.remove(&neighbor.connection_id) {
            if old_node != node_id {
                self.by_node.remove(&old_node);
            }
        }
        let conn = neighbor.connection_id;
        let previous = self.by_node.insert(node_id.clone(), neighbor);
        if let Some(prev) = &previous {
            if prev.connection_id != conn {
                self.by_connection.remove(&prev.connection_id);
            }
        }
        self.by_connection.insert(conn, node_id);
        previous
    }

    /// Remove whichever node is bound to `conn`. A node that has since re-handshaked on another
    /// connection is left untouched.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> Option<(NodeId, Neighbor)> {
        let node_id = self.by_connection.remove(&conn)?;
        let neighbor = self.by_node.remove(&node_id)?;
        Some((node_id, neighbor))
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&Neighbor> {
        self.by_node.get(node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.by_node.contains_key(node_id)
    }

    pub fn connection_of(&self, node_id: &NodeId) -> Option<ConnectionId> {
        self.by_node.get(node_id).map(|n| n.connection_id)
    }

    pub fn find_by_connection(&self, conn: ConnectionId) -> Option<&NodeId> {
        self.by_connection.get(&conn)
    }

    /// Connections of every current neighbor, in a stable order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<ConnectionId> = self.by_node.values().map(|n| n.connection_id).collect();
        conns.sort();
        conns
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Neighbor)> {
        self.by_node.iter()
    }

    /// Owned snapshot, sorted by node id.
    pub fn snapshot(&self) -> Vec<(NodeId, Neighbor)> {
        let mut out: Vec<(NodeId, Neighbor)> = self
            .by_node
            .iter()
            .map(|(id, n)| (id.clone(), n.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}
