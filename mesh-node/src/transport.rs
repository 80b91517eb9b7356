//! TCP transport: accept loop plus the per-connection reader and writer tasks.
//!
//! Readers reassemble frames and hand payloads to the dispatch loop; decoding into envelopes
//! happens there. Writers drain a connection's outbound queue of already-encoded frames.

use std::net::SocketAddr;
use std::time::Duration;

use mesh_core::{ConnectionId, FrameDecodeError, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_BUF_SIZE: usize = 16 * 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Transport notification consumed by the dispatch loop.
#[derive(Debug)]
pub enum Inbound {
    /// A peer dialed in.
    Accepted { stream: TcpStream, addr: SocketAddr },
    /// One complete frame payload (JSON, length prefix stripped).
    Frame { conn: ConnectionId, payload: Vec<u8> },
    /// The connection's stream ended or failed. May be reported more than once.
    Closed { conn: ConnectionId },
}

/// Accept incoming connections until the dispatch loop goes away.
pub async fn accept_loop(listener: TcpListener, inbound: mpsc::Sender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "accepted connection");
                if inbound.send(Inbound::Accepted { stream, addr }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Read frames from `reader` until EOF, an I/O error, or an unrecoverable framing error.
pub(crate) async fn read_loop(
    conn: ConnectionId,
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<Inbound>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(conn = %conn, error = %e, "read failed");
                break;
            }
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => {
                    if inbound.send(Inbound::Frame { conn, payload }).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(FrameDecodeError::TooLarge) => {
                    warn!(conn = %conn, "oversized frame, closing connection");
                    break 'read;
                }
                Err(e) => {
                    warn!(conn = %conn, error = %e, "framing error, closing connection");
                    break 'read;
                }
            }
        }
    }
    let _ = inbound.send(Inbound::Closed { conn }).await;
}

/// Write queued frames to `writer` until the queue is dropped or a write fails.
pub(crate) async fn write_loop(
    conn: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<Inbound>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!(conn = %conn, error = %e, "write failed");
            let _ = inbound.send(Inbound::Closed { conn }).await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Dial `addr`.
pub async fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
