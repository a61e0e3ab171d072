//! Replica directory
//!
//! In-memory table of every peer this node has heard of. Records are created
//! on first contact and never removed; a silent peer is only marked dead.
//! The table is bounded by `max_replicas`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Node identifier. Unique per node, totally ordered, and doubles as the
/// election priority: the highest live identifier becomes primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// What this node knows about one peer
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord {
    /// Peer identifier
    pub id: NodeId,
    /// Replication endpoint of the peer
    pub addr: SocketAddr,
    /// Liveness flag
    pub is_alive: bool,
    /// Last time any traffic was received from the peer
    pub last_heartbeat: Instant,
    /// Highest sequence number the peer acknowledged
    pub acked_seqn: u64,
    /// When a join request from the peer was last served
    pub last_join: Option<Instant>,
}

impl ReplicaRecord {
    fn new(id: NodeId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            is_alive: true,
            last_heartbeat: now,
            acked_seqn: 0,
            last_join: None,
        }
    }

    /// Alive and heard from within `timeout`
    pub fn is_fresh(&self, now: Instant, timeout: Duration) -> bool {
        self.is_alive && now.saturating_duration_since(self.last_heartbeat) <= timeout
    }
}

/// Record as carried inside a `ReplicaListUpdate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Peer identifier
    pub id: NodeId,
    /// Replication endpoint
    pub addr: SocketAddr,
    /// Liveness flag as seen by the sender
    pub is_alive: bool,
    /// Milliseconds since the sender last heard from this peer
    pub age_ms: u64,
}

/// Bounded table of known replicas, keyed by identifier
#[derive(Debug, Clone)]
pub struct Directory {
    records: BTreeMap<NodeId, ReplicaRecord>,
    capacity: usize,
}

impl Directory {
    /// Create an empty directory holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            capacity,
        }
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no peer is known
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a peer or refresh an existing one.
    ///
    /// Refreshing sets `is_alive`, bumps `last_heartbeat` to `now` and
    /// records the latest address. Fails with [`Error::DirectoryFull`] when
    /// the peer is new and the table is at capacity.
    pub fn upsert(&mut self, id: NodeId, addr: SocketAddr, now: Instant) -> Result<()> {
        if let Some(record) = self.records.get_mut(&id) {
            record.addr = addr;
            record.is_alive = true;
            record.last_heartbeat = now;
            return Ok(());
        }

        if self.records.len() >= self.capacity {
            return Err(Error::DirectoryFull {
                capacity: self.capacity,
            });
        }

        self.records.insert(id, ReplicaRecord::new(id, addr, now));
        Ok(())
    }

    /// Mark a known peer alive. Returns false if the peer is unknown.
    pub fn mark_alive(&mut self, id: NodeId, now: Instant) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.is_alive = true;
                record.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// Mark a known peer dead. Returns false if the peer is unknown.
    pub fn mark_dead(&mut self, id: NodeId) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.is_alive = false;
                true
            }
            None => false,
        }
    }

    /// Raise the acknowledged sequence number of a peer (never lowers it)
    pub fn record_ack(&mut self, id: NodeId, seqn: u64) {
        if let Some(record) = self.records.get_mut(&id) {
            record.acked_seqn = record.acked_seqn.max(seqn);
        }
    }

    /// Note a join request from `id` at `now`.
    ///
    /// Returns false when one was already served within `window`, so the
    /// copies of a single burst are handled once.
    pub fn record_join(&mut self, id: NodeId, now: Instant, window: Duration) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        if record
            .last_join
            .is_some_and(|at| now.saturating_duration_since(at) < window)
        {
            return false;
        }
        record.last_join = Some(now);
        true
    }

    /// Look up a single record
    pub fn get(&self, id: NodeId) -> Option<&ReplicaRecord> {
        self.records.get(&id)
    }

    /// Address of a peer, if known
    pub fn addr_of(&self, id: NodeId) -> Option<SocketAddr> {
        self.records.get(&id).map(|r| r.addr)
    }

    /// Immutable copy of all records, ordered by identifier
    pub fn snapshot(&self) -> Vec<ReplicaRecord> {
        self.records.values().cloned().collect()
    }

    /// True iff `primary` is known, alive and heard from within `timeout`
    pub fn is_primary_alive(&self, primary: Option<NodeId>, now: Instant, timeout: Duration) -> bool {
        primary
            .and_then(|id| self.records.get(&id))
            .is_some_and(|record| record.is_fresh(now, timeout))
    }

    /// Records marked alive, excluding `self_id`
    pub fn alive_peers(&self, self_id: NodeId) -> Vec<(NodeId, SocketAddr)> {
        self.records
            .values()
            .filter(|r| r.id != self_id && r.is_alive)
            .map(|r| (r.id, r.addr))
            .collect()
    }

    /// Every known peer except `self_id`, alive or not
    pub fn known_peers(&self, self_id: NodeId) -> Vec<(NodeId, SocketAddr)> {
        self.records
            .values()
            .filter(|r| r.id != self_id)
            .map(|r| (r.id, r.addr))
            .collect()
    }

    /// Alive records with an identifier above `self_id`, heard from within `timeout`
    pub fn fresh_higher_than(
        &self,
        self_id: NodeId,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(NodeId, SocketAddr)> {
        self.records
            .range(NodeId(self_id.0.saturating_add(1))..)
            .map(|(_, r)| r)
            .filter(|r| r.id > self_id && r.is_fresh(now, timeout))
            .map(|r| (r.id, r.addr))
            .collect()
    }

    /// Mark dead every peer except `self_id` silent for longer than `timeout`.
    /// Returns the identifiers that transitioned to dead.
    pub fn expire(&mut self, self_id: NodeId, now: Instant, timeout: Duration) -> Vec<NodeId> {
        let mut expired = Vec::new();
        for record in self.records.values_mut() {
            if record.id != self_id
                && record.is_alive
                && now.saturating_duration_since(record.last_heartbeat) > timeout
            {
                record.is_alive = false;
                expired.push(record.id);
            }
        }
        expired
    }

    /// Export the table for a `ReplicaListUpdate`
    pub fn to_entries(&self, now: Instant) -> Vec<PeerEntry> {
        self.records
            .values()
            .take(self.capacity)
            .map(|r| PeerEntry {
                id: r.id,
                addr: r.addr,
                is_alive: r.is_alive,
                age_ms: now.saturating_duration_since(r.last_heartbeat).as_millis() as u64,
            })
            .collect()
    }

    /// Merge entries received from a peer.
    ///
    /// Unknown peers are inserted (as far as capacity allows). Known peers
    /// are only updated when the incoming observation is more recent than
    /// the local one; `self_id` is never touched. Returns the number of
    /// entries that could not be stored because the table is full.
    pub fn merge(&mut self, self_id: NodeId, entries: &[PeerEntry], now: Instant) -> usize {
        let mut dropped = 0;
        for entry in entries {
            if entry.id == self_id {
                continue;
            }
            let seen_at = now
                .checked_sub(Duration::from_millis(entry.age_ms))
                .unwrap_or(now);

            match self.records.get_mut(&entry.id) {
                Some(local) => {
                    if seen_at > local.last_heartbeat {
                        local.last_heartbeat = seen_at;
                        local.is_alive = entry.is_alive;
                    }
                }
                None => {
                    if self.records.len() >= self.capacity {
                        dropped += 1;
                        continue;
                    }
                    let mut record = ReplicaRecord::new(entry.id, entry.addr, seen_at);
                    record.is_alive = entry.is_alive;
                    self.records.insert(entry.id, record);
                }
            }
        }
        dropped
    }
}
