//! Per-node cluster state
//!
//! Everything a node knows about the cluster lives in one [`ClusterState`]
//! guarded by a single mutex inside the node. Transitions are plain methods
//! so they can be exercised without a network.

use crate::config::Role;
use crate::directory::{Directory, NodeId};
use tokio::time::Instant;

/// Election state of a node: `Idle -> Electing -> Idle`.
///
/// How a run ended is reported separately as an [`ElectionOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// No election running on this node
    Idle,
    /// Waiting for higher identifiers to answer
    Electing {
        /// When the election started
        since: Instant,
    },
}

impl ElectionState {
    /// True while an election is running
    pub fn is_electing(&self) -> bool {
        matches!(self, Self::Electing { .. })
    }
}

/// Result of a call to `start_election`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node became primary
    Won,
    /// A higher node answered or announced victory
    Lost,
    /// Another election was already running (or this node is primary)
    Skipped,
}

/// Cluster state of one node
#[derive(Debug, Clone)]
pub struct ClusterState {
    /// This node's identifier
    pub self_id: NodeId,
    /// Current role
    pub role: Role,
    /// Primary this node believes in
    pub primary_id: Option<NodeId>,
    /// Replicated accumulator
    pub current_sum: i64,
    /// Sequence number of the last applied update
    pub last_seqn: u64,
    /// Election state machine
    pub election: ElectionState,
    /// Set once a backup has adopted state from a primary
    pub received_initial_state: bool,
    /// Known peers
    pub directory: Directory,
}

impl ClusterState {
    /// Fresh state for a node booting with `role`
    pub fn new(self_id: NodeId, role: Role, primary_id: Option<NodeId>, capacity: usize) -> Self {
        let primary_id = match role {
            Role::Primary => Some(self_id),
            Role::Backup => primary_id,
        };
        Self {
            self_id,
            role,
            primary_id,
            current_sum: 0,
            last_seqn: 0,
            election: ElectionState::Idle,
            // the bootstrap primary is its own source of truth
            received_initial_state: role == Role::Primary,
            directory: Directory::new(capacity),
        }
    }

    /// True if this node is the primary
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Claim the primary role and end any running election
    pub fn become_primary(&mut self) {
        self.role = Role::Primary;
        self.primary_id = Some(self.self_id);
        self.election = ElectionState::Idle;
        self.received_initial_state = true;
    }

    /// Follow `primary` as a backup and end any running election.
    /// Returns true if this node was primary before.
    pub fn step_down(&mut self, primary: NodeId) -> bool {
        let was_primary = self.is_primary();
        self.role = Role::Backup;
        self.primary_id = Some(primary);
        self.election = ElectionState::Idle;
        was_primary
    }

    /// Try to enter the election state. Fails if an election is already
    /// running or this node is primary.
    pub fn begin_election(&mut self, now: Instant) -> bool {
        if self.election.is_electing() || self.is_primary() {
            return false;
        }
        self.election = ElectionState::Electing { since: now };
        true
    }

    /// Adopt a replicated `sum`/`seqn` unless the local state is fresher.
    ///
    /// Equal sequence numbers are adopted, which makes redelivery of the
    /// same update a no-op. Returns true if the state was adopted.
    pub fn adopt(&mut self, sum: i64, seqn: u64) -> bool {
        if seqn < self.last_seqn {
            return false;
        }
        self.current_sum = sum;
        self.last_seqn = seqn;
        self.received_initial_state = true;
        true
    }

    /// Apply a client delta as primary
    pub fn apply_delta(&mut self, delta: i64, seqn: u64) {
        self.current_sum = self.current_sum.wrapping_add(delta);
        self.last_seqn = seqn;
    }
}
