//! Replisum Core - replicated accumulator
//!
//! A cluster of peer nodes maintains one integer sum. Exactly one node is
//! primary and accepts writes; backups track its state and replace it when
//! it disappears. This crate implements:
//! - Replica directory with liveness tracking
//! - Heartbeat-based failure detection
//! - Bully election (highest live identifier wins)
//! - Sequence-numbered, acknowledged state replication
//! - Join protocol for starting or discovered nodes
//! - Client request service on top of a node
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  Heartbeat / StateUpdate   ┌──────────────┐
//! │   Primary    │ ─────────────────────────► │   Backup 1   │
//! │              │ ◄───────────────────────── │              │
//! │ Writes here  │         StateAck           └──────────────┘
//! │              │  Heartbeat / StateUpdate   ┌──────────────┐
//! │              │ ─────────────────────────► │   Backup 2   │
//! └──────────────┘                            └──────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! One message per datagram, bincode serialization with CRC32 validation:
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod directory;
pub mod election;
pub mod error;
mod heartbeat;
mod join;
pub mod node;
pub mod protocol;
mod replicator;
pub mod retry;
pub mod service;
pub mod state;
pub mod transport;

pub use config::{PeerConfig, ReplicationConfig, Role};
pub use directory::{Directory, NodeId, PeerEntry, ReplicaRecord};
pub use error::{Error, Result};
pub use node::{Node, NodeStats};
pub use protocol::{Message, MessageType};
pub use retry::RetryPolicy;
pub use service::{ClientRequest, ClientResponse, RequestService, RequestStatus};
pub use state::{ClusterState, ElectionOutcome, ElectionState};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
