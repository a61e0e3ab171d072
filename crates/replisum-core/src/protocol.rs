//! Replication wire protocol
//!
//! Every datagram carries exactly one message, serialized with bincode and
//! validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]

use crate::directory::{NodeId, PeerEntry};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Largest datagram the transport will send or accept
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Header (type + length) plus trailing CRC
const FRAME_OVERHEAD: usize = 1 + 4 + 4;

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Primary liveness + state push
    Heartbeat = 0x01,
    /// Node asking to be registered
    JoinRequest = 0x02,
    /// Primary state propagation
    StateUpdate = 0x03,
    /// Backup acknowledgment of a state update
    StateAck = 0x04,
    /// Full replica table push
    ReplicaListUpdate = 0x05,
    /// Bully election challenge
    StartElection = 0x10,
    /// "I outrank you" answer to a challenge
    ElectionResponse = 0x11,
    /// New primary announcement
    Victory = 0x12,
    /// Acknowledgment of a victory
    VictoryAck = 0x13,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Heartbeat),
            0x02 => Ok(Self::JoinRequest),
            0x03 => Ok(Self::StateUpdate),
            0x04 => Ok(Self::StateAck),
            0x05 => Ok(Self::ReplicaListUpdate),
            0x10 => Ok(Self::StartElection),
            0x11 => Ok(Self::ElectionResponse),
            0x12 => Ok(Self::Victory),
            0x13 => Ok(Self::VictoryAck),
            _ => Err(Error::codec(format!("Unknown message type: {}", value))),
        }
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Periodic liveness + current state from the primary
    Heartbeat {
        sender: NodeId,
        sum: i64,
        seqn: u64,
        timestamp: u64,
    },

    /// Registration request from a starting or newly discovered node
    JoinRequest { sender: NodeId, timestamp: u64 },

    /// State propagation from the primary
    StateUpdate {
        sender: NodeId,
        sum: i64,
        seqn: u64,
        timestamp: u64,
    },

    /// Acknowledgment of `seqn` from a backup
    StateAck { sender: NodeId, seqn: u64 },

    /// Replica table as known by the sender
    ReplicaListUpdate {
        sender: NodeId,
        primary: Option<NodeId>,
        replicas: Vec<PeerEntry>,
    },

    /// Election challenge sent to higher identifiers
    StartElection { sender: NodeId, timestamp: u64 },

    /// Answer from a higher identifier: the contender must stand down
    ElectionResponse { sender: NodeId, timestamp: u64 },

    /// Announcement of a new primary carrying its state
    Victory {
        sender: NodeId,
        sum: i64,
        seqn: u64,
        timestamp: u64,
    },

    /// Acknowledgment of a victory, carrying the receiver's state
    VictoryAck { sender: NodeId, sum: i64, seqn: u64 },
}

impl Message {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::JoinRequest { .. } => MessageType::JoinRequest,
            Self::StateUpdate { .. } => MessageType::StateUpdate,
            Self::StateAck { .. } => MessageType::StateAck,
            Self::ReplicaListUpdate { .. } => MessageType::ReplicaListUpdate,
            Self::StartElection { .. } => MessageType::StartElection,
            Self::ElectionResponse { .. } => MessageType::ElectionResponse,
            Self::Victory { .. } => MessageType::Victory,
            Self::VictoryAck { .. } => MessageType::VictoryAck,
        }
    }

    /// Identifier of the node that sent this message
    pub fn sender(&self) -> NodeId {
        match self {
            Self::Heartbeat { sender, .. }
            | Self::JoinRequest { sender, .. }
            | Self::StateUpdate { sender, .. }
            | Self::StateAck { sender, .. }
            | Self::ReplicaListUpdate { sender, .. }
            | Self::StartElection { sender, .. }
            | Self::ElectionResponse { sender, .. }
            | Self::Victory { sender, .. }
            | Self::VictoryAck { sender, .. } => *sender,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::codec(format!("Serialization failed: {}", e)))?;

        if payload.len() + FRAME_OVERHEAD > MAX_DATAGRAM_SIZE {
            return Err(Error::codec(format!(
                "Message too large: {} bytes",
                payload.len() + FRAME_OVERHEAD
            )));
        }

        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(Error::codec("Message too short"));
        }

        // Verify CRC
        let crc_offset = buf.len() - 4;
        let stored_crc = read_u32(&buf[crc_offset..]);

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::codec(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let msg_type = MessageType::try_from(buf[0])?;
        let length = read_u32(&buf[1..5]) as usize;
        if buf.len() != FRAME_OVERHEAD + length {
            return Err(Error::codec(format!(
                "Length mismatch: header says {}, frame carries {}",
                length,
                buf.len() - FRAME_OVERHEAD
            )));
        }

        let msg: Message = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::codec(format!("Deserialization failed: {}", e)))?;

        if msg.message_type() != msg_type {
            return Err(Error::codec(format!(
                "Type mismatch: header {:?}, payload {:?}",
                msg_type,
                msg.message_type()
            )));
        }

        Ok(msg)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

/// Wall-clock timestamp (Unix millis) stamped on outgoing messages
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
