//! Host-driven API: MeshCore receives transport events from the host, returns actions.

use std::net::SocketAddr;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dedup::{SeenSet, DEFAULT_SEEN_CAPACITY};
use crate::events::MeshEvent;
use crate::handshake::{HandshakeState, HandshakeTable};
use crate::identity::{NodeId, NodeIdentity};
use crate::neighbors::{ConnectionId, Neighbor, NeighborDirectory};
use crate::protocol::{Envelope, Handshake, MessageId, MessageKind, P2PMessage, DEFAULT_TTL};
use crate::routing::{Decision, DmRouting, DropReason, Router};
use crate::wire::{self, FrameDecodeError};

/// Tunables for a single node's protocol state.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Hop budget for locally originated messages.
    pub default_ttl: u32,
    /// Message ids remembered for dedup (0 = unbounded).
    pub seen_capacity: usize,
    pub dm_routing: DmRouting,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            dm_routing: DmRouting::Direct,
        }
    }
}

/// Overrides for a locally originated send. Unset fields get a fresh id, the local node
/// as origin, and the configured default ttl.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub id: Option<MessageId>,
    pub origin: Option<NodeId>,
    pub ttl: Option<u32>,
}

impl SendOptions {
    pub fn with_ttl(ttl: u32) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Action for the host to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write the envelope to the connection. Unknown connections are dropped by the host.
    Send(ConnectionId, Envelope),
    /// Publish the event to subscribers.
    Emit(MeshEvent),
    /// Close the connection.
    Close(ConnectionId),
}

/// Protocol state of one node: neighbor directory, handshake table and router.
pub struct MeshCore {
    identity: NodeIdentity,
    config: CoreConfig,
    neighbors: NeighborDirectory,
    handshakes: HandshakeTable,
    router: Router,
}

impl MeshCore {
    pub fn new(identity: NodeIdentity) -> Self {
        Self::with_config(identity, CoreConfig::default())
    }

    pub fn with_config(identity: NodeIdentity, config: CoreConfig) -> Self {
        let router = Router::new(
            identity.node_id.clone(),
            SeenSet::new(config.seen_capacity),
            config.dm_routing,
        );
        Self {
            identity,
            config,
            neighbors: NeighborDirectory::new(),
            handshakes: HandshakeTable::new(),
            router,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn neighbors(&self) -> &NeighborDirectory {
        &self.neighbors
    }

    pub fn handshake_state(&self, conn: ConnectionId) -> Option<HandshakeState> {
        self.handshakes.state(conn)
    }

    /// Transport opened `conn` (accepted or dialed). `advertised` is the address peers can
    /// dial this node back on.
    pub fn on_connection_opened(&mut self, conn: ConnectionId, advertised: SocketAddr) -> Vec<Action> {
        debug!(conn = %conn, "connection opened, announcing identity");
        self.handshakes.open(conn);
        let hello = Envelope::Handshake(Handshake::new(&self.identity, advertised));
        self.handshakes.announced(conn);
        vec![
            Action::Emit(MeshEvent::Connect {
                connection_id: conn,
            }),
            Action::Send(conn, hello),
        ]
    }

    /// Process one frame payload received on `conn`.
    pub fn on_message_received(
        &mut self,
        conn: ConnectionId,
        payload: &[u8],
    ) -> Result<Vec<Action>, MessageError> {
        let envelope = wire::decode_payload(payload).map_err(MessageError::Decode)?;
        Ok(self.on_envelope(conn, envelope))
    }

    /// Process an already decoded envelope received on `conn`.
    pub fn on_envelope(&mut self, conn: ConnectionId, envelope: Envelope) -> Vec<Action> {
        let mut actions = vec![Action::Emit(MeshEvent::Message {
            connection_id: conn,
            envelope: envelope.clone(),
        })];
        match envelope {
            Envelope::Handshake(hello) => self.on_handshake(conn, hello, &mut actions),
            Envelope::Message(message) => self.on_routed(conn, message, &mut actions),
        }
        actions
    }

    /// Transport closed `conn`. Must be called exactly once per opened connection.
    pub fn on_connection_closed(&mut self, conn: ConnectionId) -> Vec<Action> {
        self.handshakes.close(conn);
        let mut actions = vec![Action::Emit(MeshEvent::Disconnect {
            connection_id: conn,
        })];
        if let Some((node_id, _)) = self.neighbors.remove_connection(conn) {
            info!(node = %node_id, conn = %conn, "neighbor disconnected");
            actions.push(Action::Emit(MeshEvent::NodeDisconnect { node_id }));
        }
        actions
    }

    /// Flood `data` toward `destination`. Returns the message id and the actions to perform.
    pub fn broadcast(
        &mut self,
        data: Value,
        destination: NodeId,
        options: SendOptions,
    ) -> (MessageId, Vec<Action>) {
        self.originate(MessageKind::Broadcast, data, destination, options)
    }

    /// Send `data` to `destination` over its neighbor link.
    pub fn dm(
        &mut self,
        data: Value,
        destination: NodeId,
        options: SendOptions,
    ) -> (MessageId, Vec<Action>) {
        self.originate(MessageKind::Dm, data, destination, options)
    }

    fn originate(
        &mut self,
        kind: MessageKind,
        data: Value,
        destination: NodeId,
        options: SendOptions,
    ) -> (MessageId, Vec<Action>) {
        let message = P2PMessage {
            id: options.id.unwrap_or_else(MessageId::random),
            ttl: options.ttl.unwrap_or(self.config.default_ttl),
            origin: options
                .origin
                .unwrap_or_else(|| self.identity.node_id.clone()),
            destination,
            kind,
            data,
        };
        let id = message.id.clone();
        debug!(id = %id, kind = %kind, destination = %message.destination, ttl = message.ttl, "originating");
        let decision = self.router.originate(message, &self.neighbors);
        let mut actions = Vec::new();
        self.apply(decision, None, &mut actions);
        (id, actions)
    }

    fn on_handshake(&mut self, conn: ConnectionId, hello: Handshake, actions: &mut Vec<Action>) {
        if hello.node_id == self.identity.node_id {
            warn!(conn = %conn, "peer announced our own node id, closing self-connection");
            actions.push(Action::Close(conn));
            return;
        }
        let first = self.handshakes.establish(conn);
        let renamed = self.neighbors.find_by_connection(conn) != Some(&hello.node_id);
        // A connection that re-announces under a new id takes the old node off the mesh.
        let displaced = self
            .neighbors
            .find_by_connection(conn)
            .filter(|id| **id != hello.node_id)
            .cloned();
        let neighbor = Neighbor {
            connection_id: conn,
            node_name: hello.node_name.clone(),
            device_type: hello.device_type,
            addr: hello.advertised_addr(),
        };
        if let Some(prev) = self.neighbors.insert(hello.node_id.clone(), neighbor) {
            if prev.connection_id != conn {
                info!(node = %hello.node_id, old = %prev.connection_id, new = %conn, "neighbor reconnected, replacing entry");
            }
        }
        if let Some(node_id) = displaced {
            info!(node = %node_id, conn = %conn, "connection re-announced, dropping previous node");
            actions.push(Action::Emit(MeshEvent::NodeDisconnect { node_id }));
        }
        if first || renamed {
            info!(node = %hello.node_id, name = %hello.node_name, conn = %conn, "handshake complete");
            actions.push(Action::Emit(MeshEvent::NodeConnect {
                node_id: hello.node_id,
                node_name: hello.node_name,
                device_type: hello.device_type,
                connection_id: conn,
                addr: SocketAddr::new(hello.ip, hello.port),
            }));
        }
    }

    fn on_routed(&mut self, conn: ConnectionId, message: P2PMessage, actions: &mut Vec<Action>) {
        if message.is_expired() {
            debug!(conn = %conn, id = %message.id, "dropping message with exhausted ttl");
            return;
        }
        let source = self.neighbors.find_by_connection(conn).cloned();
        if source.is_none() {
            warn!(conn = %conn, id = %message.id, "message before handshake, routing best-effort");
        }
        actions.push(Action::Emit(MeshEvent::NodeMessage {
            node_id: source.clone(),
            message: message.clone(),
        }));
        let decision = self.router.route_inbound(message, &self.neighbors);
        self.apply(decision, source, actions);
    }

    fn apply(&self, decision: Decision, from: Option<NodeId>, actions: &mut Vec<Action>) {
        match decision {
            Decision::Deliver(message) => {
                debug!(id = %message.id, kind = %message.kind, origin = %message.origin, "delivering locally");
                let event = match message.kind {
                    MessageKind::Broadcast => MeshEvent::Broadcast { from, message },
                    MessageKind::Dm => MeshEvent::Dm {
                        origin: message.origin.clone(),
                        message,
                    },
                };
                actions.push(Action::Emit(event));
            }
            Decision::Forward { message, targets } => {
                debug!(id = %message.id, ttl = message.ttl, targets = targets.len(), "forwarding");
                for conn in targets {
                    actions.push(Action::Send(conn, Envelope::Message(message.clone())));
                }
            }
            Decision::Drop(reason @ (DropReason::Unreachable(_) | DropReason::NoNeighbors)) => {
                warn!(reason = %reason, "message not routed");
            }
            Decision::Drop(reason) => {
                debug!(reason = %reason, "message dropped");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to decode message: {0}")]
    Decode(#[source] FrameDecodeError),
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use super::*;
    use crate::identity::DeviceType;
    use serde_json::json;

    /// In-memory mesh: shuttles `Action::Send` frames between cores until quiescent.
    struct Sim {
        cores: Vec<MeshCore>,
        links: HashMap<(usize, ConnectionId), (usize, ConnectionId)>,
        next_conn: u64,
        queue: VecDeque<(usize, ConnectionId, Vec<u8>)>,
        events: Vec<(usize, MeshEvent)>,
        transmissions: usize,
    }

    impl Sim {
        fn new(ids: &[&str]) -> Self {
            Self::with_config(ids, CoreConfig::default())
        }

        fn with_config(ids: &[&str], config: CoreConfig) -> Self {
            let cores = ids
                .iter()
                .map(|id| {
                    MeshCore::with_config(
                        NodeIdentity::new(*id, format!("{}-name", id), DeviceType::Desktop),
                        config.clone(),
                    )
                })
                .collect();
            Self {
                cores,
                links: HashMap::new(),
                next_conn: 0,
                queue: VecDeque::new(),
                events: Vec::new(),
                transmissions: 0,
            }
        }

        fn index(&self, id: &str) -> usize {
            self.cores
                .iter()
                .position(|c| c.node_id().as_str() == id)
                .unwrap()
        }

        fn core(&self, id: &str) -> &MeshCore {
            &self.cores[self.index(id)]
        }

        fn alloc(&mut self) -> ConnectionId {
            self.next_conn += 1;
            ConnectionId::from_raw(self.next_conn)
        }

        /// Open a link between two nodes and run both handshakes. Returns (conn at a, conn at b).
        fn link(&mut self, a: &str, b: &str) -> (ConnectionId, ConnectionId) {
            let (ia, ib) = (self.index(a), self.index(b));
            let (ca, cb) = (self.alloc(), self.alloc());
            self.links.insert((ia, ca), (ib, cb));
            self.links.insert((ib, cb), (ia, ca));
            let actions = self.cores[ia].on_connection_opened(ca, advertised(ia));
            self.handle(ia, actions);
            let actions = self.cores[ib].on_connection_opened(cb, advertised(ib));
            self.handle(ib, actions);
            self.run();
            (ca, cb)
        }

        fn close(&mut self, node: usize, conn: ConnectionId) {
            if let Some((peer, peer_conn)) = self.links.remove(&(node, conn)) {
                self.links.remove(&(peer, peer_conn));
                let actions = self.cores[peer].on_connection_closed(peer_conn);
                self.handle(peer, actions);
            }
            let actions = self.cores[node].on_connection_closed(conn);
            self.handle(node, actions);
        }

        fn handle(&mut self, node: usize, actions: Vec<Action>) {
            for action in actions {
                match action {
                    Action::Send(conn, env) => {
                        if let Some(&(peer, peer_conn)) = self.links.get(&(node, conn)) {
                            let frame = wire::encode_frame(&env).unwrap();
                            let (payload, _) = wire::split_frame(&frame).unwrap();
                            self.queue.push_back((peer, peer_conn, payload.to_vec()));
                            self.transmissions += 1;
                        }
                    }
                    Action::Emit(ev) => self.events.push((node, ev)),
                    Action::Close(conn) => self.close(node, conn),
                }
            }
        }

        fn run(&mut self) {
            let mut steps = 0;
            while let Some((node, conn, payload)) = self.queue.pop_front() {
                steps += 1;
                assert!(steps < 10_000, "flooding did not terminate");
                let actions = self.cores[node].on_message_received(conn, &payload).unwrap();
                self.handle(node, actions);
            }
        }

        fn broadcast(&mut self, from: &str, data: Value, to: &str, options: SendOptions) {
            let i = self.index(from);
            let (_, actions) = self.cores[i].broadcast(data, to.into(), options);
            self.handle(i, actions);
            self.run();
        }

        fn dm(&mut self, from: &str, data: Value, to: &str, options: SendOptions) {
            let i = self.index(from);
            let (_, actions) = self.cores[i].dm(data, to.into(), options);
            self.handle(i, actions);
            self.run();
        }

        fn deliveries(&self, id: &str) -> Vec<&MeshEvent> {
            let i = self.index(id);
            self.events
                .iter()
                .filter(|(n, ev)| *n == i && ev.is_delivery())
                .map(|(_, ev)| ev)
                .collect()
        }

        fn named(&self, id: &str, name: &str) -> usize {
            let i = self.index(id);
            self.events
                .iter()
                .filter(|(n, ev)| *n == i && ev.name() == name)
                .count()
        }
    }

    fn advertised(i: usize) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000 + i as u16))
    }

    fn broadcast_envelope(id: &str, ttl: u32, destination: &str) -> Envelope {
        Envelope::Message(P2PMessage {
            id: MessageId::from(id),
            ttl,
            origin: "A".into(),
            destination: destination.into(),
            kind: MessageKind::Broadcast,
            data: json!({"data": "x"}),
        })
    }

    #[test]
    fn opened_connection_announces_identity() {
        let mut core = MeshCore::new(NodeIdentity::new("A", "alpha", DeviceType::Mobile));
        let conn = ConnectionId::from_raw(1);
        let actions = core.on_connection_opened(conn, "10.0.0.1:7070".parse().unwrap());
        assert_eq!(
            actions[0],
            Action::Emit(MeshEvent::Connect {
                connection_id: conn
            })
        );
        match &actions[1] {
            Action::Send(c, Envelope::Handshake(h)) => {
                assert_eq!(*c, conn);
                assert_eq!(h.node_id, NodeId::from("A"));
                assert_eq!(h.device_type, DeviceType::Mobile);
                assert_eq!(h.port, 7070);
            }
            other => panic!("expected handshake, got {:?}", other),
        }
        assert_eq!(
            core.handshake_state(conn),
            Some(HandshakeState::AwaitingHandshake)
        );
    }

    #[test]
    fn handshake_populates_single_neighbor_on_arrival_connection() {
        let mut sim = Sim::new(&["A", "B"]);
        let (ca, cb) = sim.link("A", "B");

        let a = sim.core("A");
        assert_eq!(a.neighbors().len(), 1);
        assert_eq!(a.neighbors().connection_of(&"B".into()), Some(ca));
        assert_eq!(a.handshake_state(ca), Some(HandshakeState::Established));
        let b = sim.core("B");
        assert_eq!(b.neighbors().connection_of(&"A".into()), Some(cb));
        let entry = b.neighbors().get(&"A".into()).unwrap();
        assert_eq!(entry.node_name, "A-name");
        assert_eq!(entry.addr, advertised(0));

        assert_eq!(sim.named("A", "node-connect"), 1);
        assert_eq!(sim.named("B", "node-connect"), 1);
    }

    #[test]
    fn repeated_handshake_does_not_renotify() {
        let mut core = MeshCore::new(NodeIdentity::new("A", "alpha", DeviceType::Desktop));
        let conn = ConnectionId::from_raw(1);
        core.on_connection_opened(conn, advertised(0));
        let peer = NodeIdentity::new("B", "beta", DeviceType::Desktop);
        let hello = Envelope::Handshake(Handshake::new(&peer, advertised(1)));
        let first = core.on_envelope(conn, hello.clone());
        let second = core.on_envelope(conn, hello);
        let connects = |actions: &[Action]| {
            actions
                .iter()
                .filter(|a| matches!(a, Action::Emit(MeshEvent::NodeConnect { .. })))
                .count()
        };
        assert_eq!(connects(&first), 1);
        assert_eq!(connects(&second), 0);
        assert_eq!(core.neighbors().len(), 1);
    }

    #[test]
    fn reannounced_id_disconnects_previous_node() {
        let mut core = MeshCore::new(NodeIdentity::new("A", "alpha", DeviceType::Desktop));
        let conn = ConnectionId::from_raw(1);
        core.on_connection_opened(conn, advertised(0));
        let first = NodeIdentity::new("B", "beta", DeviceType::Desktop);
        core.on_envelope(conn, Envelope::Handshake(Handshake::new(&first, advertised(1))));

        let second = NodeIdentity::new("C", "gamma", DeviceType::Mobile);
        let actions =
            core.on_envelope(conn, Envelope::Handshake(Handshake::new(&second, advertised(2))));
        let gone: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(MeshEvent::NodeDisconnect { node_id }) => Some(node_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(gone, vec!["B"]);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(MeshEvent::NodeConnect { node_id, connection_id, .. })
                if node_id.as_str() == "C" && *connection_id == conn
        )));
        assert!(!core.neighbors().contains(&"B".into()));
        assert_eq!(core.neighbors().connection_of(&"C".into()), Some(conn));
        assert_eq!(core.neighbors().len(), 1);
    }

    #[test]
    fn self_connection_is_closed() {
        let identity = NodeIdentity::new("A", "alpha", DeviceType::Desktop);
        let mut core = MeshCore::new(identity.clone());
        let conn = ConnectionId::from_raw(1);
        core.on_connection_opened(conn, advertised(0));
        let actions = core.on_envelope(conn, Envelope::Handshake(Handshake::new(&identity, advertised(0))));
        assert!(actions.contains(&Action::Close(conn)));
        assert!(core.neighbors().is_empty());
    }

    #[test]
    fn dm_between_neighbors() {
        let mut sim = Sim::new(&["A", "B"]);
        sim.link("A", "B");
        sim.dm("A", json!({"data": "hi"}), "B", SendOptions::default());

        let deliveries = sim.deliveries("B");
        assert_eq!(deliveries.len(), 1);
        match deliveries[0] {
            MeshEvent::Dm { origin, message } => {
                assert_eq!(origin, &NodeId::from("A"));
                assert_eq!(message.data, json!({"data": "hi"}));
                assert_eq!(message.ttl, DEFAULT_TTL);
            }
            other => panic!("expected dm, got {:?}", other),
        }
        assert!(sim.deliveries("A").is_empty());
    }

    #[test]
    fn chain_broadcast_ttl_two_reaches_destination_once() {
        let mut sim = Sim::new(&["A", "B", "C"]);
        sim.link("A", "B");
        sim.link("B", "C");
        sim.broadcast("A", json!({"data": "x"}), "C", SendOptions::with_ttl(2));

        let deliveries = sim.deliveries("C");
        assert_eq!(deliveries.len(), 1);
        match deliveries[0] {
            MeshEvent::Broadcast { from, message } => {
                assert_eq!(from.as_ref(), Some(&NodeId::from("B")));
                assert_eq!(message.origin, NodeId::from("A"));
                assert_eq!(message.ttl, 1);
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[test]
    fn chain_broadcast_ttl_one_falls_short() {
        let mut sim = Sim::new(&["A", "B", "C"]);
        sim.link("A", "B");
        sim.link("B", "C");
        sim.broadcast("A", json!({"data": "x"}), "C", SendOptions::with_ttl(1));
        assert!(sim.deliveries("C").is_empty());
        assert_eq!(sim.named("C", "node-message"), 0);
    }

    #[test]
    fn triangle_flood_terminates_with_single_delivery() {
        let mut sim = Sim::new(&["A", "B", "C"]);
        sim.link("A", "B");
        sim.link("B", "C");
        sim.link("A", "C");
        let before = sim.transmissions;
        sim.broadcast("A", json!({"data": "x"}), "C", SendOptions::default());

        assert_eq!(sim.deliveries("C").len(), 1);
        assert!(sim.deliveries("A").is_empty());
        assert!(sim.deliveries("B").is_empty());
        // A floods to 2 neighbors, B forwards once to 2 neighbors, C never forwards.
        assert_eq!(sim.transmissions - before, 4);
    }

    #[test]
    fn ring_of_five_floods_once_per_node() {
        let ids = ["A", "B", "C", "D", "E"];
        let mut sim = Sim::new(&ids);
        for w in ids.windows(2) {
            sim.link(w[0], w[1]);
        }
        sim.link("E", "A");
        sim.broadcast("A", json!({"data": "x"}), "D", SendOptions::default());
        assert_eq!(sim.deliveries("D").len(), 1);
        for id in ["A", "B", "C", "E"] {
            assert!(sim.deliveries(id).is_empty());
            assert!(sim.core(id).router.seen().len() <= 1);
        }
    }

    #[test]
    fn duplicate_broadcast_delivered_once() {
        let mut sim = Sim::new(&["B", "C"]);
        let (_, cc) = sim.link("B", "C");
        let c = sim.index("C");
        let first = sim.cores[c].on_envelope(cc, broadcast_envelope("m1", 5, "C"));
        let second = sim.cores[c].on_envelope(cc, broadcast_envelope("m1", 5, "C"));
        sim.handle(c, first);
        sim.handle(c, second);
        assert_eq!(sim.deliveries("C").len(), 1);
    }

    #[test]
    fn expired_envelope_dropped_on_arrival() {
        let mut sim = Sim::new(&["B", "C"]);
        let (_, cc) = sim.link("B", "C");
        let c = sim.index("C");
        let actions = sim.cores[c].on_envelope(cc, broadcast_envelope("m1", 0, "C"));
        // Only the raw `message` notification; no routing, no node-message, no delivery.
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::Emit(MeshEvent::Message { .. })));
    }

    #[test]
    fn ttl_decreases_by_one_per_hop() {
        let ids = ["A", "B", "C", "D"];
        let mut sim = Sim::new(&ids);
        for w in ids.windows(2) {
            sim.link(w[0], w[1]);
        }
        sim.broadcast("A", json!(null), "D", SendOptions::with_ttl(10));
        let ttl_at = |id: &str| {
            let i = sim.index(id);
            sim.events
                .iter()
                .find_map(|(n, ev)| match ev {
                    MeshEvent::NodeMessage { message, .. } if *n == i => Some(message.ttl),
                    _ => None,
                })
                .unwrap()
        };
        assert_eq!(ttl_at("B"), 10);
        assert_eq!(ttl_at("C"), 9);
        assert_eq!(ttl_at("D"), 8);
    }

    #[test]
    fn disconnect_removes_neighbor() {
        let mut sim = Sim::new(&["A", "B"]);
        let (ca, _) = sim.link("A", "B");
        let a = sim.index("A");
        sim.close(a, ca);

        assert!(sim.core("A").neighbors().is_empty());
        assert!(sim.core("B").neighbors().is_empty());
        assert_eq!(sim.named("A", "disconnect"), 1);
        assert_eq!(sim.named("A", "node-disconnect"), 1);
        assert_eq!(sim.core("A").handshake_state(ca), None);

        // A later DM fails quietly: B is no longer a neighbor.
        sim.dm("A", json!({"data": "late"}), "B", SendOptions::default());
        assert!(sim.deliveries("B").is_empty());
    }

    #[test]
    fn stale_connection_close_keeps_fresh_neighbor() {
        let mut sim = Sim::new(&["A", "B"]);
        let (old, _) = sim.link("A", "B");
        let (fresh, _) = sim.link("A", "B");
        assert_eq!(sim.core("A").neighbors().connection_of(&"B".into()), Some(fresh));

        let a = sim.index("A");
        let actions = sim.cores[a].on_connection_closed(old);
        assert!(!actions
            .iter()
            .any(|ac| matches!(ac, Action::Emit(MeshEvent::NodeDisconnect { .. }))));
        assert_eq!(sim.core("A").neighbors().connection_of(&"B".into()), Some(fresh));
    }

    #[test]
    fn message_before_handshake_is_routed_best_effort() {
        let mut core = MeshCore::new(NodeIdentity::new("C", "gamma", DeviceType::Desktop));
        let conn = ConnectionId::from_raw(9);
        let actions = core.on_envelope(conn, broadcast_envelope("m1", 3, "C"));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(MeshEvent::NodeMessage { node_id: None, .. })
        )));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Emit(MeshEvent::Broadcast { from: None, .. })
        )));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut core = MeshCore::new(NodeIdentity::new("A", "alpha", DeviceType::Desktop));
        let result = core.on_message_received(ConnectionId::from_raw(1), b"{\"type\":\"nope\"}");
        assert!(matches!(result, Err(MessageError::Decode(_))));
    }

    #[test]
    fn send_to_self_delivers_without_network() {
        let mut core = MeshCore::new(NodeIdentity::new("A", "alpha", DeviceType::Desktop));
        let (id, actions) = core.dm(json!({"data": 1}), "A".into(), SendOptions::default());
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::Emit(MeshEvent::Dm { message, .. }) => assert_eq!(message.id, id),
            other => panic!("expected dm delivery, got {:?}", other),
        }
    }

    #[test]
    fn send_options_override_envelope_fields() {
        let mut sim = Sim::new(&["A", "B"]);
        sim.link("A", "B");
        let options = SendOptions {
            id: Some("fixed".into()),
            origin: Some("Z".into()),
            ttl: Some(7),
        };
        sim.broadcast("A", json!({"data": "x"}), "B", options);
        match sim.deliveries("B")[0] {
            MeshEvent::Broadcast { message, .. } => {
                assert_eq!(message.id, MessageId::from("fixed"));
                assert_eq!(message.origin, NodeId::from("Z"));
                assert_eq!(message.ttl, 7);
            }
            other => panic!("expected broadcast, got {:?}", other),
        }
    }

    #[test]
    fn dm_to_non_neighbor_depends_on_routing_mode() {
        let mut direct = Sim::new(&["A", "B", "C"]);
        direct.link("A", "B");
        direct.link("B", "C");
        direct.dm("A", json!({"data": "hi"}), "C", SendOptions::default());
        assert!(direct.deliveries("C").is_empty());

        let config = CoreConfig {
            dm_routing: DmRouting::Flood,
            ..CoreConfig::default()
        };
        let mut flood = Sim::with_config(&["A", "B", "C"], config);
        flood.link("A", "B");
        flood.link("B", "C");
        flood.link("A", "C");
        flood.dm("A", json!({"data": "hi"}), "C", SendOptions::default());
        assert_eq!(flood.deliveries("C").len(), 1);

        // Non-adjacent destination reached by flooding through B.
        let config = CoreConfig {
            dm_routing: DmRouting::Flood,
            ..CoreConfig::default()
        };
        let mut chain = Sim::with_config(&["A", "B", "C"], config);
        chain.link("A", "B");
        chain.link("B", "C");
        chain.dm("A", json!({"data": "hi"}), "C", SendOptions::default());
        assert_eq!(chain.deliveries("C").len(), 1);
    }
}
