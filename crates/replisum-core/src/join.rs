//! Join handling and replica list exchange

use crate::directory::{NodeId, PeerEntry};
use crate::node::{Effects, Node};
use crate::protocol::{Message, now_millis};
use crate::state::ClusterState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Instant;

impl Node {
    /// Ask the believed primary for the current state until it arrives or
    /// `join_attempts` rounds of `join_timeout` have passed.
    pub(crate) async fn join_loop(self: Arc<Self>) {
        for attempt in 1..=self.config.join_attempts.max(1) {
            let target = {
                let state = self.state.lock();
                if state.received_initial_state || state.is_primary() {
                    return;
                }
                state
                    .primary_id
                    .and_then(|id| state.directory.addr_of(id).map(|addr| (id, addr)))
            };
            let Some((primary, addr)) = target else {
                tracing::warn!(node = %self.config.node_id, "No primary known, cannot join");
                return;
            };

            tracing::info!(
                node = %self.config.node_id,
                peer = %primary,
                "Joining primary at {} (attempt {})",
                addr,
                attempt
            );
            self.send_burst(&self.join_request(), addr, self.config.retry).await;

            let deadline = Instant::now() + self.config.join_timeout;
            while Instant::now() < deadline {
                if self.has_initial_state() {
                    tracing::info!(
                        node = %self.config.node_id,
                        "Joined with sum {} seqn {}",
                        self.current_sum(),
                        self.last_seqn()
                    );
                    return;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.ack_poll_interval) => {}
                }
            }
        }

        if !self.has_initial_state() {
            tracing::warn!(
                node = %self.config.node_id,
                "No state from primary after {} join attempts",
                self.config.join_attempts
            );
        }
    }

    /// Announce this node to an address found by external discovery.
    ///
    /// The peer's reply registers it in the directory.
    pub async fn add_discovered_replica(&self, addr: SocketAddr) {
        if addr == self.transport.local_addr() {
            return;
        }
        tracing::info!(node = %self.config.node_id, "Contacting discovered replica at {}", addr);
        self.send_burst(&self.join_request(), addr, self.config.retry).await;
    }

    fn join_request(&self) -> Message {
        Message::JoinRequest {
            sender: self.config.node_id,
            timestamp: now_millis(),
        }
    }

    /// Replica list as sent to peers, with this node's own entry fresh
    fn replica_list(&self, state: &mut ClusterState, now: Instant) -> Message {
        state.directory.mark_alive(state.self_id, now);
        Message::ReplicaListUpdate {
            sender: state.self_id,
            primary: state.primary_id,
            replicas: state.directory.to_entries(now),
        }
    }

    /// Handle `JoinRequest`.
    ///
    /// The primary answers with the replica list and an immediate
    /// `StateUpdate`, and pushes the list to the other backups when the
    /// joiner is new. A backup answers with its list so the joiner learns
    /// who the primary is. Requests repeated within half a `join_timeout`
    /// are copies of one burst and get no second answer.
    pub(crate) fn on_join_request(
        &self,
        state: &mut ClusterState,
        from: NodeId,
        newly_added: bool,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        let Some(from_addr) = state.directory.addr_of(from) else {
            return effects;
        };
        if !state
            .directory
            .record_join(from, now, self.config.join_timeout / 2)
        {
            tracing::trace!(node = %state.self_id, peer = %from, "Join request already served");
            return effects;
        }

        let list = self.replica_list(state, now);

        if !state.is_primary() {
            tracing::debug!(node = %state.self_id, peer = %from, "Join request on backup, sending replica list");
            effects.send(list, from_addr);
            return effects;
        }

        tracing::info!(node = %state.self_id, peer = %from, "Replica joined from {}", from_addr);
        self.stats.lock().joins_handled += 1;

        effects.send(list.clone(), from_addr);
        effects.send(
            Message::StateUpdate {
                sender: state.self_id,
                sum: state.current_sum,
                seqn: state.last_seqn,
                timestamp: now_millis(),
            },
            from_addr,
        );

        if newly_added {
            let others: Vec<_> = state
                .directory
                .alive_peers(state.self_id)
                .into_iter()
                .filter(|(id, _)| *id != from)
                .collect();
            effects.broadcast(&list, &others);
        }
        effects
    }

    /// Handle `ReplicaListUpdate`: merge the entries and learn the primary.
    ///
    /// The advertised primary replaces ours when the list comes from that
    /// primary itself or when our own primary is no longer alive. A backup
    /// that switches primary re-joins it to fetch the state.
    pub(crate) fn on_replica_list(
        &self,
        state: &mut ClusterState,
        from: NodeId,
        primary: Option<NodeId>,
        entries: &[PeerEntry],
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();

        let dropped = state.directory.merge(state.self_id, entries, now);
        if dropped > 0 {
            tracing::warn!(
                node = %state.self_id,
                "Replica directory full, {} entries from {} dropped",
                dropped,
                from
            );
        }

        let Some(primary) = primary else {
            return effects;
        };
        if primary == state.self_id || state.primary_id == Some(primary) {
            return effects;
        }

        if state.is_primary() {
            // a lower primary is corrected by our heartbeats; a higher one wins
            if primary > state.self_id && from == primary {
                state.step_down(primary);
                self.stats.lock().step_downs += 1;
                tracing::warn!(node = %state.self_id, peer = %primary, "Higher primary announced, stepping down");
            } else {
                return effects;
            }
        } else {
            let current_alive = state.directory.is_primary_alive(
                state.primary_id,
                now,
                self.config.primary_timeout,
            );
            if from != primary && current_alive {
                return effects;
            }
            tracing::info!(
                node = %state.self_id,
                peer = %primary,
                "Learned primary from {} (was {:?})",
                from,
                state.primary_id
            );
            state.primary_id = Some(primary);
        }

        if from != primary {
            if let Some(addr) = state.directory.addr_of(primary) {
                effects.send(self.join_request(), addr);
            }
        }
        effects
    }
}
