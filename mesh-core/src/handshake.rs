//! Per-connection handshake state: `Opened -> AwaitingHandshake -> Established`.
//!
//! Each side announces itself once; there is no acknowledgement. A connection is
//! `Established` from the local point of view as soon as the peer's announcement arrives,
//! regardless of whether the peer has processed ours yet.

use std::collections::HashMap;

use crate::neighbors::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Transport is up, our announcement has not been queued yet.
    Opened,
    /// Our announcement is queued; waiting for the peer's.
    AwaitingHandshake,
    /// Peer identity known; the connection backs a neighbor entry.
    Established,
}

#[derive(Debug, Default)]
pub struct HandshakeTable {
    states: HashMap<ConnectionId, HandshakeState>,
}

impl HandshakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, conn: ConnectionId) {
        self.states.insert(conn, HandshakeState::Opened);
    }

    /// Our own announcement has been queued.
    pub fn announced(&mut self, conn: ConnectionId) {
        let state = self.states.entry(conn).or_insert(HandshakeState::Opened);
        if *state == HandshakeState::Opened {
            *state = HandshakeState::AwaitingHandshake;
        }
    }

    /// Peer announcement received. Returns `true` on the first transition to `Established`.
    pub fn establish(&mut self, conn: ConnectionId) -> bool {
        let previous = self.states.insert(conn, HandshakeState::Established);
        previous != Some(HandshakeState::Established)
    }

    pub fn state(&self, conn: ConnectionId) -> Option<HandshakeState> {
        self.states.get(&conn).copied()
    }

    pub fn is_established(&self, conn: ConnectionId) -> bool {
        self.state(conn) == Some(HandshakeState::Established)
    }

    pub fn close(&mut self, conn: ConnectionId) -> Option<HandshakeState> {
        self.states.remove(&conn)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
