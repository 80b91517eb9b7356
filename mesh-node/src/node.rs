//! Control surface for a running node.

use std::net::SocketAddr;

use mesh_core::{
    ConnectionId, MeshCore, MeshEvent, MessageId, Neighbor, NodeId, NodeIdentity, SendOptions,
};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use crate::config::NodeConfig;
use crate::dispatcher::{Command, Dispatcher};
use crate::registry::ConnectionRegistry;
use crate::transport;

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node is closed")]
    Closed,
}

/// Handle to a running node. Cheap to clone; the node stops on [`Node::close`] or when the
/// last handle is dropped.
#[derive(Clone)]
pub struct Node {
    identity: NodeIdentity,
    local_addr: SocketAddr,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<MeshEvent>,
}

impl Node {
    /// Bind the listening socket and spawn the dispatch loop. Bootstrap peers in
    /// `config.peers` are not dialed here.
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        let bind = config.bind_addr();
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| NodeError::Bind { addr: bind, source })?;
        let local_addr = listener.local_addr()?;

        let identity = config.identity();
        let core = MeshCore::with_config(identity.clone(), config.core_config());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let acceptor = tokio::spawn(transport::accept_loop(listener, inbound_tx.clone()));
        let dispatcher = Dispatcher::new(
            core,
            ConnectionRegistry::new(config.outbound_queue),
            events.clone(),
            inbound_tx,
            inbound_rx,
            command_rx,
            acceptor,
            local_addr,
        );
        tokio::spawn(dispatcher.run());

        info!(
            node = %identity.node_id,
            name = %identity.node_name,
            device = %identity.device_type,
            addr = %local_addr,
            "node listening"
        );
        Ok(Node {
            identity,
            local_addr,
            commands: command_tx,
            events,
        })
    }

    /// Close every connection and stop the node. Completes once the dispatch loop has exited;
    /// closing an already closed node is a no-op.
    pub async fn close(&self) -> Result<(), NodeError> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(NodeError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Dial `addr` and register the connection. The handshake runs in the background;
    /// subscribe for `NodeConnect` to learn when the peer is a neighbor.
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnectionId, NodeError> {
        if self.commands.is_closed() {
            return Err(NodeError::Closed);
        }
        let stream = transport::connect(addr)
            .await
            .map_err(|source| NodeError::Connect { addr, source })?;
        self.request(|reply| Command::Adopt {
            stream,
            addr,
            reply,
        })
        .await
    }

    /// Dial `addr` unless `node_id` is already a neighbor. Returns `None` when no new
    /// connection was made.
    pub async fn connect_if_absent(
        &self,
        addr: SocketAddr,
        node_id: &NodeId,
    ) -> Result<Option<ConnectionId>, NodeError> {
        if node_id == &self.identity.node_id || self.has_neighbor(node_id).await? {
            return Ok(None);
        }
        self.connect(addr).await.map(Some)
    }

    /// Answer a `NodeConnect` by dialing the address the peer advertised, unless it is
    /// already a neighbor. Other events are ignored.
    pub async fn dial_back(&self, event: &MeshEvent) -> Result<Option<ConnectionId>, NodeError> {
        match event {
            MeshEvent::NodeConnect { node_id, addr, .. } => {
                self.connect_if_absent(*addr, node_id).await
            }
            _ => Ok(None),
        }
    }

    pub async fn broadcast(
        &self,
        data: Value,
        destination: impl Into<NodeId>,
    ) -> Result<MessageId, NodeError> {
        self.broadcast_with(data, destination, SendOptions::default())
            .await
    }

    /// Flood `data` toward `destination`. Routing failures are logged, never returned.
    pub async fn broadcast_with(
        &self,
        data: Value,
        destination: impl Into<NodeId>,
        options: SendOptions,
    ) -> Result<MessageId, NodeError> {
        let destination = destination.into();
        self.request(|reply| Command::Broadcast {
            data,
            destination,
            options,
            reply,
        })
        .await
    }

    pub async fn dm(
        &self,
        data: Value,
        destination: impl Into<NodeId>,
    ) -> Result<MessageId, NodeError> {
        self.dm_with(data, destination, SendOptions::default()).await
    }

    /// Send `data` to a neighbor. Routing failures are logged, never returned.
    pub async fn dm_with(
        &self,
        data: Value,
        destination: impl Into<NodeId>,
        options: SendOptions,
    ) -> Result<MessageId, NodeError> {
        let destination = destination.into();
        self.request(|reply| Command::Dm {
            data,
            destination,
            options,
            reply,
        })
        .await
    }

    /// Current neighbors, sorted by node id.
    pub async fn neighbors(&self) -> Result<Vec<(NodeId, Neighbor)>, NodeError> {
        self.request(|reply| Command::Neighbors { reply }).await
    }

    pub async fn has_neighbor(&self, node_id: &NodeId) -> Result<bool, NodeError> {
        let node_id = node_id.clone();
        self.request(|reply| Command::HasNeighbor { node_id, reply })
            .await
    }

    /// Close one connection. Returns `false` if it was not open.
    pub async fn disconnect(&self, conn: ConnectionId) -> Result<bool, NodeError> {
        self.request(|reply| Command::Disconnect { conn, reply })
            .await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    /// Receive every event emitted from now on. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| NodeError::Closed)?;
        rx.await.map_err(|_| NodeError::Closed)
    }
}
