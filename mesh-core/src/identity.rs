//! Node identity: stable node id, display name and device type.

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Opaque unique node identifier. Generated nodes use a UUIDv4 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Fresh random node id.
    pub fn random() -> Self {
        NodeId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Kind of device a node runs on. Advertised in the handshake, informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Desktop => f.write_str("desktop"),
            DeviceType::Mobile => f.write_str("mobile"),
        }
    }
}

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceType::Desktop),
            "mobile" => Ok(DeviceType::Mobile),
            _ => Err(UnknownDeviceType(s.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown device type {0:?} (expected desktop or mobile)")]
pub struct UnknownDeviceType(pub String);

/// Identity a node announces to its neighbors. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub node_name: String,
    pub device_type: DeviceType,
}

impl NodeIdentity {
    pub fn new(node_id: impl Into<NodeId>, node_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            device_type,
        }
    }

    /// Generate a new identity: random node id and a random `adjective-color-animal` name.
    pub fn generate(device_type: DeviceType) -> Self {
        Self {
            node_id: NodeId::random(),
            node_name: generate_node_name(),
            device_type,
        }
    }
}

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "eager", "fancy", "gentle", "happy", "jolly", "kind", "lively", "proud",
    "quiet", "silly", "swift", "witty", "zealous",
];
const COLORS: &[&str] = &[
    "amber", "azure", "coral", "crimson", "gold", "indigo", "ivory", "jade", "lime", "magenta",
    "olive", "plum", "silver", "teal", "violet",
];
const ANIMALS: &[&str] = &[
    "badger", "beaver", "crane", "dolphin", "falcon", "ferret", "gecko", "heron", "koala",
    "lemur", "otter", "panda", "raven", "salmon", "walrus",
];

/// Random human-readable display name, e.g. `swift-teal-otter`.
pub fn generate_node_name() -> String {
    let mut rng = rand::thread_rng();
    let pick = |words: &[&'static str], rng: &mut rand::rngs::ThreadRng| -> &'static str {
        words.choose(rng).copied().unwrap_or("node")
    };
    format!(
        "{}-{}-{}",
        pick(ADJECTIVES, &mut rng),
        pick(COLORS, &mut rng),
        pick(ANIMALS, &mut rng)
    )
}
