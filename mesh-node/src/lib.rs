//! tokio host for the mesh overlay: TCP transport, connection registry, the dispatch loop
//! that drives `MeshCore`, and the [`Node`] control surface.

pub mod config;
mod dispatcher;
pub mod node;
pub mod registry;
pub mod transport;

pub use config::{ConfigError, NodeConfig};
pub use node::{Node, NodeError};
pub use registry::{ConnectionRegistry, SendError};

pub use mesh_core::{
    ConnectionId, DeviceType, DmRouting, MeshEvent, MessageId, Neighbor, NodeId, NodeIdentity,
    P2PMessage, SendOptions,
};
