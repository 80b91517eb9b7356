//! Dispatch loop: the only task that touches `MeshCore` and the connection registry.
//!
//! Transport notifications arrive on the inbound channel, control requests from [`Node`]
//! handles on the command channel. Every `Action` the core returns is performed here.
//!
//! [`Node`]: crate::node::Node

use std::net::SocketAddr;
use std::ops::ControlFlow;

use mesh_core::{
    Action, ConnectionId, MeshCore, MeshEvent, MessageId, Neighbor, NodeId, SendOptions,
};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;
use crate::transport::Inbound;

/// Request from a `Node` handle. Replies travel back on the embedded oneshot.
pub(crate) enum Command {
    /// Register a freshly dialed stream.
    Adopt {
        stream: TcpStream,
        addr: SocketAddr,
        reply: oneshot::Sender<ConnectionId>,
    },
    Broadcast {
        data: Value,
        destination: NodeId,
        options: SendOptions,
        reply: oneshot::Sender<MessageId>,
    },
    Dm {
        data: Value,
        destination: NodeId,
        options: SendOptions,
        reply: oneshot::Sender<MessageId>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<(NodeId, Neighbor)>>,
    },
    HasNeighbor {
        node_id: NodeId,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        conn: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct Dispatcher {
    core: MeshCore,
    registry: ConnectionRegistry,
    events: broadcast::Sender<MeshEvent>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound: mpsc::Receiver<Inbound>,
    commands: mpsc::Receiver<Command>,
    acceptor: JoinHandle<()>,
    listen_addr: SocketAddr,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core: MeshCore,
        registry: ConnectionRegistry,
        events: broadcast::Sender<MeshEvent>,
        inbound_tx: mpsc::Sender<Inbound>,
        inbound: mpsc::Receiver<Inbound>,
        commands: mpsc::Receiver<Command>,
        acceptor: JoinHandle<()>,
        listen_addr: SocketAddr,
    ) -> Self {
        Self {
            core,
            registry,
            events,
            inbound_tx,
            inbound,
            commands,
            acceptor,
            listen_addr,
        }
    }

    /// Run until a `Shutdown` command arrives or every `Node` handle is dropped.
    pub(crate) async fn run(mut self) {
        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                Some(inbound) = self.inbound.recv() => self.on_inbound(inbound),
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(reply) = self.on_command(command) {
                            shutdown_reply = Some(reply);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.shutdown();
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Accepted { stream, addr } => {
                self.adopt(stream, addr);
            }
            Inbound::Frame { conn, payload } => {
                if !self.registry.contains(conn) {
                    return;
                }
                match self.core.on_message_received(conn, &payload) {
                    Ok(actions) => self.apply(actions),
                    Err(e) => warn!(conn = %conn, error = %e, "dropping undecodable message"),
                }
            }
            Inbound::Closed { conn } => self.close(conn),
        }
    }

    /// Breaks with the reply channel on `Shutdown`.
    fn on_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Adopt {
                stream,
                addr,
                reply,
            } => {
                let conn = self.adopt(stream, addr);
                let _ = reply.send(conn);
            }
            Command::Broadcast {
                data,
                destination,
                options,
                reply,
            } => {
                let (id, actions) = self.core.broadcast(data, destination, options);
                self.apply(actions);
                let _ = reply.send(id);
            }
            Command::Dm {
                data,
                destination,
                options,
                reply,
            } => {
                let (id, actions) = self.core.dm(data, destination, options);
                self.apply(actions);
                let _ = reply.send(id);
            }
            Command::Neighbors { reply } => {
                let _ = reply.send(self.core.neighbors().snapshot());
            }
            Command::HasNeighbor { node_id, reply } => {
                let _ = reply.send(self.core.neighbors().contains(&node_id));
            }
            Command::Disconnect { conn, reply } => {
                let known = self.registry.contains(conn);
                self.close(conn);
                let _ = reply.send(known);
            }
            Command::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    fn adopt(&mut self, stream: TcpStream, addr: SocketAddr) -> ConnectionId {
        let _ = stream.set_nodelay(true);
        // Advertise the interface this socket actually uses, not the wildcard bind address.
        let ip = stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|_| self.listen_addr.ip());
        let advertised = SocketAddr::new(ip, self.listen_addr.port());
        let conn = self.registry.open(stream, addr, self.inbound_tx.clone());
        let actions = self.core.on_connection_opened(conn, advertised);
        self.apply(actions);
        conn
    }

    fn close(&mut self, conn: ConnectionId) {
        if self.registry.close(conn) {
            let actions = self.core.on_connection_closed(conn);
            self.apply(actions);
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(conn, envelope) => {
                    if let Err(e) = self.registry.send(conn, &envelope) {
                        warn!(conn = %conn, error = %e, "send failed");
                    }
                }
                Action::Emit(event) => {
                    // No subscribers is not an error.
                    let _ = self.events.send(event);
                }
                Action::Close(conn) => self.close(conn),
            }
        }
    }

    fn shutdown(&mut self) {
        self.acceptor.abort();
        for conn in self.registry.close_all() {
            let actions = self.core.on_connection_closed(conn);
            self.apply(actions);
        }
        info!(node = %self.core.node_id(), "node closed");
    }
}
