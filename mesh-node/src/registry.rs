//! Connection registry: maps connection ids to live TCP connections.
//!
//! Owned by the dispatch loop, so it needs no locking. Each entry holds the bounded outbound
//! queue drained by the connection's writer task and the handles of both I/O tasks.

use std::collections::HashMap;
use std::net::SocketAddr;

use mesh_core::{encode_frame, ConnectionId, Envelope, FrameEncodeError};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{self, Inbound};

struct Connection {
    peer: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct ConnectionRegistry {
    next_id: u64,
    queue_len: usize,
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    /// `queue_len` is the outbound queue depth per connection, in frames.
    pub fn new(queue_len: usize) -> Self {
        Self {
            next_id: 0,
            queue_len: queue_len.max(1),
            connections: HashMap::new(),
        }
    }

    /// Take ownership of `stream` and spawn its reader and writer. Frames and the close
    /// notification are reported on `inbound`.
    pub fn open(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        inbound: mpsc::Sender<Inbound>,
    ) -> ConnectionId {
        self.next_id += 1;
        let conn = ConnectionId::from_raw(self.next_id);
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::channel(self.queue_len);
        let reader = tokio::spawn(transport::read_loop(conn, read_half, inbound.clone()));
        let writer = tokio::spawn(transport::write_loop(conn, write_half, queue, inbound));
        debug!(conn = %conn, peer = %peer, "connection registered");
        self.connections.insert(
            conn,
            Connection {
                peer,
                outbound,
                reader,
                writer,
            },
        );
        conn
    }

    /// Queue `envelope` on `conn` without waiting.
    pub fn send(&self, conn: ConnectionId, envelope: &Envelope) -> Result<(), SendError> {
        let connection = self.connections.get(&conn).ok_or(SendError::NotFound(conn))?;
        let frame = encode_frame(envelope)?;
        connection.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull(conn),
            TrySendError::Closed(_) => SendError::NotFound(conn),
        })
    }

    /// Remove `conn` and abort both of its tasks. Frames still queued are discarded and the
    /// socket is released even if the peer has stopped reading. Returns `false` if it was
    /// already gone.
    pub fn close(&mut self, conn: ConnectionId) -> bool {
        match self.connections.remove(&conn) {
            Some(connection) => {
                connection.reader.abort();
                connection.writer.abort();
                debug!(conn = %conn, peer = %connection.peer, "connection closed");
                true
            }
            None => false,
        }
    }

    /// Close every connection. Returns the ids that were open.
    pub fn close_all(&mut self) -> Vec<ConnectionId> {
        let mut ids = self.ids();
        ids.retain(|conn| self.close(*conn));
        ids
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.connections.contains_key(&conn)
    }

    pub fn peer_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&conn).map(|c| c.peer)
    }

    /// Open connection ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("{0} is not an open connection")]
    NotFound(ConnectionId),
    #[error("outbound queue of {0} is full, frame dropped")]
    QueueFull(ConnectionId),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}
