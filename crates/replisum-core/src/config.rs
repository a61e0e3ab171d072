//! Replication configuration

use crate::directory::NodeId;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Role a node takes when it boots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts and serializes writes
    Primary,
    /// Tracks the primary and is eligible to replace it
    Backup,
}

impl Default for Role {
    fn default() -> Self {
        Self::Backup
    }
}

/// A statically known peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer identifier
    pub id: NodeId,
    /// Replication endpoint of the peer
    pub addr: SocketAddr,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This node's identifier (election priority)
    pub node_id: NodeId,

    /// Address to bind for replication traffic
    pub bind_addr: SocketAddr,

    /// Role at startup
    pub role: Role,

    /// Primary a backup should join at startup
    pub primary_id: Option<NodeId>,

    /// Seed peers (must include the primary for a backup)
    pub peers: Vec<PeerConfig>,

    /// Interval between primary heartbeats
    #[serde(with = "serde_millis")]
    pub heartbeat_interval: Duration,

    /// Interval between failure-detector checks on backups
    #[serde(with = "serde_millis")]
    pub check_interval: Duration,

    /// Silence after which a backup declares the primary dead
    #[serde(with = "serde_millis")]
    pub primary_timeout: Duration,

    /// Silence after which a peer no longer counts as a live contender
    #[serde(with = "serde_millis")]
    pub replica_timeout: Duration,

    /// How long a contender waits for a higher node to answer
    #[serde(with = "serde_millis")]
    pub election_timeout: Duration,

    /// Base request timeout; acks are awaited for twice this long
    #[serde(with = "serde_millis")]
    pub request_timeout: Duration,

    /// How long a joining backup waits for the initial state per round
    #[serde(with = "serde_millis")]
    pub join_timeout: Duration,

    /// Poll period while waiting for acknowledgments
    #[serde(with = "serde_millis")]
    pub ack_poll_interval: Duration,

    /// Bounded receive timeout of the transport
    #[serde(with = "serde_millis")]
    pub recv_timeout: Duration,

    /// Upper bound of the randomized pre-election backoff
    #[serde(with = "serde_millis")]
    pub election_jitter: Duration,

    /// Maximum number of replicas in the directory
    pub max_replicas: usize,

    /// Number of join rounds before a backup gives up waiting
    pub join_attempts: u32,

    /// Datagram repetition policy
    pub retry: RetryPolicy,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(2000),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 2002)),
            role: Role::Backup,
            primary_id: None,
            peers: Vec::new(),
            heartbeat_interval: Duration::from_millis(1000),
            check_interval: Duration::from_secs(1),
            primary_timeout: Duration::from_secs(5),
            replica_timeout: Duration::from_secs(3),
            election_timeout: Duration::from_millis(5000),
            request_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_secs(5),
            ack_poll_interval: Duration::from_millis(10),
            recv_timeout: Duration::from_millis(100),
            election_jitter: Duration::from_millis(200),
            max_replicas: 10,
            join_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a configuration for the bootstrap primary
    pub fn primary(node_id: NodeId, bind_addr: SocketAddr) -> Self {
        Self {
            node_id,
            bind_addr,
            role: Role::Primary,
            primary_id: Some(node_id),
            ..Default::default()
        }
    }

    /// Create a backup configuration that joins `primary_id` at `primary_addr`
    pub fn backup(
        node_id: NodeId,
        bind_addr: SocketAddr,
        primary_id: NodeId,
        primary_addr: SocketAddr,
    ) -> Self {
        Self {
            node_id,
            bind_addr,
            role: Role::Backup,
            primary_id: Some(primary_id),
            peers: vec![PeerConfig {
                id: primary_id,
                addr: primary_addr,
            }],
            ..Default::default()
        }
    }

    /// Add a seed peer
    pub fn with_peer(mut self, id: NodeId, addr: SocketAddr) -> Self {
        if !self.peers.iter().any(|p| p.id == id) {
            self.peers.push(PeerConfig { id, addr });
        }
        self
    }

    /// Set heartbeat interval and primary timeout together
    pub fn with_heartbeat(mut self, interval: Duration, primary_timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.primary_timeout = primary_timeout;
        self
    }

    /// Set the election timeout
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Set the directory capacity
    pub fn with_max_replicas(mut self, max_replicas: usize) -> Self {
        self.max_replicas = max_replicas;
        self
    }

    /// Set the datagram repetition policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Scale every timer down for in-process clusters and tests.
    ///
    /// Heartbeats every 50ms, primary declared dead after 300ms, elections
    /// resolved within 250ms.
    pub fn fast(mut self) -> Self {
        self.heartbeat_interval = Duration::from_millis(50);
        self.check_interval = Duration::from_millis(50);
        self.primary_timeout = Duration::from_millis(300);
        self.replica_timeout = Duration::from_millis(300);
        self.election_timeout = Duration::from_millis(250);
        self.request_timeout = Duration::from_millis(100);
        self.join_timeout = Duration::from_millis(300);
        self.ack_poll_interval = Duration::from_millis(5);
        self.recv_timeout = Duration::from_millis(20);
        self.election_jitter = Duration::from_millis(40);
        self.retry = RetryPolicy::new(3, Duration::from_millis(2));
        self
    }

    /// How long the write path waits for acknowledgments
    pub fn ack_timeout(&self) -> Duration {
        self.request_timeout * 2
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        match self.role {
            Role::Backup => {
                if let Some(primary) = self.primary_id {
                    if primary == self.node_id {
                        return Err("Backup cannot name itself as primary_id".into());
                    }
                    if !self.peers.iter().any(|p| p.id == primary) {
                        return Err(format!("primary_id {} has no entry in peers", primary));
                    }
                }
            }
            Role::Primary => {
                if self.primary_id.is_some_and(|p| p != self.node_id) {
                    return Err("Primary must have primary_id equal to node_id".into());
                }
            }
        }

        if self.peers.iter().any(|p| p.id == self.node_id) {
            return Err("peers must not contain this node".into());
        }

        if self.max_replicas == 0 {
            return Err("max_replicas must be at least 1".into());
        }

        if self.peers.len() >= self.max_replicas {
            return Err(format!(
                "{} peers do not fit into max_replicas {}",
                self.peers.len(),
                self.max_replicas
            ));
        }

        for (name, value) in [
            ("heartbeat_interval", self.heartbeat_interval),
            ("check_interval", self.check_interval),
            ("election_timeout", self.election_timeout),
            ("request_timeout", self.request_timeout),
            ("recv_timeout", self.recv_timeout),
            ("ack_poll_interval", self.ack_poll_interval),
        ] {
            if value.is_zero() {
                return Err(format!("{} must be greater than zero", name));
            }
        }

        if self.primary_timeout <= self.heartbeat_interval {
            return Err("primary_timeout must exceed heartbeat_interval".into());
        }

        Ok(())
    }
}
