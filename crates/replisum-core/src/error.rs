//! Error types for the replication core

use crate::directory::NodeId;
use thiserror::Error;

/// Result type alias using the replication [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for replisum
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from the datagram socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encoding/decoding errors (bad CRC, truncated frame, ...)
    #[error("Codec error: {0}")]
    Codec(String),

    /// Transport-level failures other than raw I/O
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Write attempted on a node that is not the primary
    #[error("Not primary (current primary: {primary:?})")]
    NotPrimary {
        /// The primary this node currently believes in, if any
        primary: Option<NodeId>,
    },

    /// Update committed locally but not acknowledged by every live backup
    #[error("Replication incomplete for seqn {seqn}: no ack from {missing:?}")]
    ReplicationIncomplete {
        /// Sequence number of the update
        seqn: u64,
        /// Backups that did not acknowledge in time
        missing: Vec<NodeId>,
    },

    /// Replica directory is at capacity
    #[error("Replica directory full (capacity {capacity})")]
    DirectoryFull {
        /// Configured maximum number of replicas
        capacity: usize,
    },

    /// The node is shutting down
    #[error("Node is shutting down")]
    Shutdown,
}

impl Error {
    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Status code reported to the external request service.
    ///
    /// 0 = success, 1 = not primary, 2 = replication incomplete. Any other
    /// failure on the write path is reported as 2 as well, since the caller
    /// cannot tell whether the update reached the backups.
    pub fn status_code(&self) -> u8 {
        match self {
            Self::NotPrimary { .. } => 1,
            _ => 2,
        }
    }

    /// Whether a send that failed with this error is worth repeating
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(io_error) => matches!(
                io_error.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
            ),
            Self::Transport(_) => true,
            _ => false,
        }
    }
}
