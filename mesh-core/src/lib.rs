//! Mesh overlay protocol: identity, wire format, neighbor directory and flooding router.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod protocol;
pub mod wire;

pub use identity::{generate_node_name, DeviceType, NodeId, NodeIdentity};
pub use protocol::{Envelope, Handshake, MessageId, MessageKind, P2PMessage, DEFAULT_TTL};
pub use wire::{
    decode_frame, decode_payload, encode_frame, split_frame, FrameDecodeError, FrameDecoder,
    FrameEncodeError, MAX_FRAME_LEN,
};
pub use core::{Action, CoreConfig, MeshCore, MessageError, SendOptions};
pub use events::MeshEvent;
pub use neighbors::{ConnectionId, Neighbor, NeighborDirectory};
pub use routing::{Decision, DmRouting, DropReason};

pub mod core;
pub mod dedup;
pub mod events;
pub mod handshake;
pub mod neighbors;
pub mod routing;
