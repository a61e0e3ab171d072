//! Server configuration
//!
//! Layered in increasing priority: defaults, TOML file, `REPLISUM_*`
//! environment variables, command-line flags.

use anyhow::{Context, bail};
use replisum_core::{NodeId, PeerConfig, ReplicationConfig, Role};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Distance between a node's client port and its replication port
pub const REPLICATION_PORT_OFFSET: u16 = 2;

/// Server configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Endpoint answering client requests
    pub client_addr: Option<SocketAddr>,
    /// Replication settings; `node.bind_addr` is the replication endpoint
    pub node: NodeSection,
}

/// `[node]` table of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node identifier
    pub id: Option<NodeId>,
    /// Replication endpoint
    pub bind_addr: Option<SocketAddr>,
    /// Primary to join at startup; none means this node starts as primary
    pub primary: Option<PeerConfig>,
    /// Additional seed peers
    pub peers: Vec<PeerConfig>,
    /// Timing and capacity overrides
    pub replication: Option<ReplicationConfig>,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--id`
    pub id: Option<NodeId>,
    /// `--bind`
    pub bind_addr: Option<SocketAddr>,
    /// `--client-bind`
    pub client_addr: Option<SocketAddr>,
    /// `--primary`
    pub primary: Option<PeerConfig>,
    /// `--peer`, repeatable
    pub peers: Vec<PeerConfig>,
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply `REPLISUM_*` overrides read through `lookup`
    ///
    /// Recognized: `REPLISUM_NODE_ID`, `REPLISUM_BIND`, `REPLISUM_CLIENT_BIND`,
    /// `REPLISUM_PRIMARY` (`id@addr`), `REPLISUM_PEERS` (comma separated
    /// `id@addr`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(id) = lookup("REPLISUM_NODE_ID") {
            let id: u32 = id
                .trim()
                .parse()
                .with_context(|| format!("Invalid REPLISUM_NODE_ID {:?}", id))?;
            self.node.id = Some(NodeId(id));
        }
        if let Some(addr) = lookup("REPLISUM_BIND") {
            self.node.bind_addr = Some(parse_addr("REPLISUM_BIND", &addr)?);
        }
        if let Some(addr) = lookup("REPLISUM_CLIENT_BIND") {
            self.client_addr = Some(parse_addr("REPLISUM_CLIENT_BIND", &addr)?);
        }
        if let Some(primary) = lookup("REPLISUM_PRIMARY") {
            self.node.primary = Some(parse_peer(&primary)?);
        }
        if let Some(peers) = lookup("REPLISUM_PEERS") {
            self.node.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(parse_peer)
                .collect::<anyhow::Result<_>>()?;
        }
        Ok(())
    }

    /// Apply command-line overrides
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if overrides.id.is_some() {
            self.node.id = overrides.id;
        }
        if overrides.bind_addr.is_some() {
            self.node.bind_addr = overrides.bind_addr;
        }
        if overrides.client_addr.is_some() {
            self.client_addr = overrides.client_addr;
        }
        if overrides.primary.is_some() {
            self.node.primary = overrides.primary;
        }
        if !overrides.peers.is_empty() {
            self.node.peers = overrides.peers;
        }
    }

    /// Client and replication endpoints.
    ///
    /// When only one is configured the other sits `REPLICATION_PORT_OFFSET`
    /// ports away from it.
    pub fn endpoints(&self) -> anyhow::Result<(SocketAddr, SocketAddr)> {
        let endpoints = match (self.client_addr, self.node.bind_addr) {
            (Some(client), Some(bind)) => (client, bind),
            (Some(client), None) => {
                let Some(port) = client.port().checked_add(REPLICATION_PORT_OFFSET) else {
                    bail!("No replication port above client port {}", client.port());
                };
                (client, SocketAddr::new(client.ip(), port))
            }
            (None, Some(bind)) => {
                let Some(port) = bind.port().checked_sub(REPLICATION_PORT_OFFSET) else {
                    bail!("No client port below replication port {}", bind.port());
                };
                (SocketAddr::new(bind.ip(), port), bind)
            }
            (None, None) => {
                let bind = ReplicationConfig::default().bind_addr;
                let client = SocketAddr::new(bind.ip(), bind.port() - REPLICATION_PORT_OFFSET);
                (client, bind)
            }
        };
        if endpoints.0 == endpoints.1 && endpoints.0.port() != 0 {
            bail!("Client and replication endpoints are both {}", endpoints.0);
        }
        Ok(endpoints)
    }

    /// Build and validate the replication configuration
    pub fn replication(&self) -> anyhow::Result<ReplicationConfig> {
        let (_, bind_addr) = self.endpoints()?;
        let mut config = self.node.replication.clone().unwrap_or_default();

        let Some(node_id) = self.node.id else {
            bail!("Node id is required (--id, REPLISUM_NODE_ID or node.id)");
        };
        config.node_id = node_id;
        config.bind_addr = bind_addr;
        config.peers.clear();

        match self.node.primary {
            Some(primary) if primary.id != node_id => {
                config.role = Role::Backup;
                config.primary_id = Some(primary.id);
                config = config.with_peer(primary.id, primary.addr);
            }
            _ => {
                config.role = Role::Primary;
                config.primary_id = Some(node_id);
            }
        }
        for peer in &self.node.peers {
            if peer.id != node_id {
                config = config.with_peer(peer.id, peer.addr);
            }
        }

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid replication config: {}", e))?;
        Ok(config)
    }
}

fn parse_addr(name: &str, value: &str) -> anyhow::Result<SocketAddr> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} address {:?}", name, value))
}

/// Parse `id@host:port`
pub fn parse_peer(value: &str) -> anyhow::Result<PeerConfig> {
    let Some((id, addr)) = value.trim().split_once('@') else {
        bail!("Expected id@host:port, got {:?}", value);
    };
    let id: u32 = id
        .parse()
        .with_context(|| format!("Invalid peer id in {:?}", value))?;
    Ok(PeerConfig {
        id: NodeId(id),
        addr: parse_addr("peer", addr)?,
    })
}
