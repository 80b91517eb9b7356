//! Load config from file and environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use mesh_core::dedup::DEFAULT_SEEN_CAPACITY;
use mesh_core::{CoreConfig, DeviceType, DmRouting, NodeId, NodeIdentity, DEFAULT_TTL};
use serde::Deserialize;

/// Node configuration. File: ~/.config/mesh-node/config.toml or /etc/mesh-node/config.toml.
/// Env overrides: MESH_HOST, MESH_PORT, MESH_NODE_ID, MESH_NODE_NAME, MESH_DEVICE_TYPE,
/// MESH_PEERS (comma-separated).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Bind address (default 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Listen port (default 7070, 0 picks an ephemeral port).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Stable node id; a UUIDv4 is generated when absent.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Display name; a random `adjective-color-animal` when absent.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub device_type: DeviceType,
    /// Bootstrap peers dialed at startup.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    /// Frames buffered per connection before sends are dropped.
    #[serde(default = "default_queue")]
    pub outbound_queue: usize,
    /// Frames buffered between readers and the dispatch loop.
    #[serde(default = "default_queue")]
    pub inbound_queue: usize,
    /// Events buffered per subscriber before it lags.
    #[serde(default = "default_queue")]
    pub event_capacity: usize,
    #[serde(default)]
    pub dm_routing: DmRouting,
    /// Dial back every node that announces itself (default true).
    #[serde(default = "default_densify")]
    pub densify: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    7070
}
fn default_ttl() -> u32 {
    DEFAULT_TTL
}
fn default_seen_capacity() -> usize {
    DEFAULT_SEEN_CAPACITY
}
fn default_queue() -> usize {
    1024
}
fn default_densify() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            node_id: None,
            node_name: None,
            device_type: DeviceType::default(),
            peers: Vec::new(),
            default_ttl: default_ttl(),
            seen_capacity: default_seen_capacity(),
            outbound_queue: default_queue(),
            inbound_queue: default_queue(),
            event_capacity: default_queue(),
            dm_routing: DmRouting::default(),
            densify: default_densify(),
        }
    }
}

impl NodeConfig {
    /// Loopback config on an ephemeral port, for running several nodes in one process.
    pub fn local(node_id: impl Into<NodeId>) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })
    }

    /// Identity to announce: configured values, generated where missing.
    pub fn identity(&self) -> NodeIdentity {
        let mut identity = NodeIdentity::generate(self.device_type);
        if let Some(id) = &self.node_id {
            identity.node_id = id.clone();
        }
        if let Some(name) = &self.node_name {
            identity.node_name = name.clone();
        }
        identity
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            default_ttl: self.default_ttl,
            seen_capacity: self.seen_capacity,
            dm_routing: self.dm_routing,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Apply `MESH_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(s) = lookup("MESH_HOST") {
            self.host = parse_var("MESH_HOST", &s)?;
        }
        if let Some(s) = lookup("MESH_PORT") {
            self.port = parse_var("MESH_PORT", &s)?;
        }
        if let Some(s) = lookup("MESH_NODE_ID") {
            self.node_id = Some(NodeId::new(s));
        }
        if let Some(s) = lookup("MESH_NODE_NAME") {
            self.node_name = Some(s);
        }
        if let Some(s) = lookup("MESH_DEVICE_TYPE") {
            self.device_type = parse_var("MESH_DEVICE_TYPE", &s)?;
        }
        if let Some(s) = lookup("MESH_PEERS") {
            self.peers = s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| parse_var("MESH_PEERS", p))
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_owned(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config{}: {source}", path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Load config: defaults, then the config file (explicit path, or the first that exists),
/// then env vars.
pub fn load(explicit: Option<&Path>) -> Result<NodeConfig, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => NodeConfig::default(),
        },
    };
    c.apply_env(|key| std::env::var(key).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/mesh-node/config.toml"));
    }
    out.push(PathBuf::from("/etc/mesh-node/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: Some(path.to_path_buf()),
        source,
    })
}
