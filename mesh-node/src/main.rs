// mesh-node: flooding overlay daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mesh_node::{config, DeviceType, MeshEvent, Node, NodeConfig, NodeError};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "mesh_node=info,mesh_core=info";

#[derive(Parser, Debug)]
#[command(name = "mesh-node", version, about = "Flooding P2P overlay node")]
struct Args {
    /// Listen port (0 picks an ephemeral port)
    #[arg(long)]
    port: Option<u16>,
    /// Config file (default: ~/.config/mesh-node/config.toml, then /etc/mesh-node/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Display name announced to neighbors
    #[arg(long)]
    name: Option<String>,
    /// desktop or mobile
    #[arg(long)]
    device_type: Option<DeviceType>,
    /// Peer to dial at startup; repeatable
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<SocketAddr>,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(name) = &self.name {
            config.node_name = Some(name.clone());
        }
        if let Some(device_type) = self.device_type {
            config.device_type = device_type;
        }
        config.peers.extend(self.connect.iter().copied());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut cfg = config::load(args.config.as_deref()).context("loading config")?;
    args.apply(&mut cfg);
    let peers = cfg.peers.clone();
    let densify = cfg.densify;

    let node = Node::start(cfg).await.context("starting node")?;
    let mut events = node.subscribe();
    let handle = node.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    log_event(&event);
                    if densify {
                        dial_back(&handle, &event).await;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for peer in peers {
        match node.connect(peer).await {
            Ok(conn) => info!(peer = %peer, conn = %conn, "dialed bootstrap peer"),
            Err(e) => warn!(error = %e, "bootstrap peer unreachable"),
        }
    }

    shutdown_signal().await?;
    info!("shutdown signal received");
    node.close().await?;
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::Broadcast { from, message } => info!(
            id = %message.id,
            origin = %message.origin,
            via = from.as_ref().map(|n| n.as_str()).unwrap_or("-"),
            data = %message.data,
            "broadcast received"
        ),
        MeshEvent::Dm { origin, message } => info!(
            id = %message.id,
            origin = %origin,
            data = %message.data,
            "dm received"
        ),
        MeshEvent::NodeConnect {
            node_id,
            node_name,
            addr,
            ..
        } => info!(node = %node_id, name = %node_name, addr = %addr, "node connected"),
        MeshEvent::NodeDisconnect { node_id } => info!(node = %node_id, "node disconnected"),
        other => debug!(event = other.name(), "event"),
    }
}

async fn dial_back(node: &Node, event: &MeshEvent) {
    match node.dial_back(event).await {
        Ok(Some(conn)) => info!(conn = %conn, "dialed back announced node"),
        Ok(None) => {}
        Err(NodeError::Closed) => {}
        Err(e) => warn!(error = %e, "dial back failed"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
