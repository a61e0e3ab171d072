//! Bully election
//!
//! The live node with the highest identifier becomes primary. A contender
//! challenges every fresh higher node and wins by default when none of them
//! answers within `election_timeout`. Any node observing a lower node claim
//! the primary role pushes back, so concurrent elections converge on the
//! highest identifier.

use crate::directory::NodeId;
use crate::node::{Effects, Node};
use crate::protocol::{Message, now_millis};
use crate::state::{ClusterState, ElectionOutcome, ElectionState};
use std::time::Duration;
use tokio::time::Instant;

impl Node {
    /// Run one bully election from this node.
    ///
    /// Returns [`ElectionOutcome::Skipped`] if an election is already running
    /// here or this node is already primary.
    pub async fn start_election(&self) -> ElectionOutcome {
        let started = Instant::now();
        let higher = {
            let mut state = self.state.lock();
            if !state.begin_election(started) {
                return ElectionOutcome::Skipped;
            }
            state
                .directory
                .fresh_higher_than(state.self_id, started, self.config.replica_timeout)
        };
        self.stats.lock().elections_started += 1;

        tracing::info!(
            node = %self.config.node_id,
            "Starting election, {} higher candidate(s)",
            higher.len()
        );

        if higher.is_empty() {
            return self.declare_victory().await;
        }

        let challenge = Message::StartElection {
            sender: self.config.node_id,
            timestamp: now_millis(),
        };
        self.broadcast(&challenge, &higher, self.config.retry).await;

        let deadline = started + self.config.election_timeout;
        loop {
            {
                let state = self.state.lock();
                if !state.election.is_electing() {
                    return if state.is_primary() {
                        ElectionOutcome::Won
                    } else {
                        tracing::info!(node = %state.self_id, "Election lost, following {:?}", state.primary_id);
                        ElectionOutcome::Lost
                    };
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.config.ack_poll_interval.min(deadline - now);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state.lock().election = ElectionState::Idle;
                    return ElectionOutcome::Lost;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(
            node = %self.config.node_id,
            "No answer from higher nodes within {:?}",
            self.config.election_timeout
        );
        self.declare_victory().await
    }

    /// Take the primary role and announce it to every known peer
    async fn declare_victory(&self) -> ElectionOutcome {
        let (victory, targets) = {
            let mut state = self.state.lock();
            // a victory or response may have landed since the last check
            if !state.election.is_electing() {
                return if state.is_primary() {
                    ElectionOutcome::Won
                } else {
                    ElectionOutcome::Lost
                };
            }
            state.become_primary();
            tracing::info!(
                node = %state.self_id,
                "Became primary with sum {} seqn {}",
                state.current_sum,
                state.last_seqn
            );
            (
                self.victory_message(&state),
                state.directory.known_peers(state.self_id),
            )
        };
        self.stats.lock().elections_won += 1;

        self.broadcast(&victory, &targets, self.config.retry).await;
        ElectionOutcome::Won
    }

    pub(crate) fn victory_message(&self, state: &ClusterState) -> Message {
        Message::Victory {
            sender: state.self_id,
            sum: state.current_sum,
            seqn: state.last_seqn,
            timestamp: now_millis(),
        }
    }

    /// Handle `StartElection` from a contender.
    ///
    /// Only a node that outranks the contender (or already leads) answers;
    /// it then runs its own election, or reasserts itself if it is primary.
    pub(crate) fn on_start_election(&self, state: &mut ClusterState, from: NodeId) -> Effects {
        let mut effects = Effects::default();
        if from >= state.self_id && !state.is_primary() {
            tracing::debug!(node = %state.self_id, peer = %from, "Ignoring election from higher node");
            return effects;
        }
        let Some(from_addr) = state.directory.addr_of(from) else {
            return effects;
        };

        tracing::info!(node = %state.self_id, peer = %from, "Answering election challenge");
        effects.reply(
            Message::ElectionResponse {
                sender: state.self_id,
                timestamp: now_millis(),
            },
            from_addr,
        );

        if state.is_primary() {
            effects.send(self.victory_message(state), from_addr);
        } else {
            effects.elect();
        }
        effects
    }

    /// Handle `ElectionResponse`: a higher node is alive, stand down
    pub(crate) fn on_election_response(&self, state: &mut ClusterState, from: NodeId) -> Effects {
        if from > state.self_id && state.election.is_electing() {
            state.election = ElectionState::Idle;
            tracing::info!(node = %state.self_id, peer = %from, "Outranked, standing down from election");
        }
        Effects::default()
    }

    /// Handle `Victory` from a new primary.
    ///
    /// A higher winner is always accepted; its state is adopted unless the
    /// local state carries a newer sequence number. A lower winner is
    /// challenged: this node reasserts itself if primary, or runs an
    /// election otherwise.
    pub(crate) fn on_victory(
        &self,
        state: &mut ClusterState,
        from: NodeId,
        sum: i64,
        seqn: u64,
    ) -> Effects {
        let mut effects = Effects::default();
        let Some(from_addr) = state.directory.addr_of(from) else {
            return effects;
        };

        if from < state.self_id {
            if state.is_primary() {
                tracing::warn!(node = %state.self_id, peer = %from, "Lower node claims primary, reasserting");
                effects.send(self.victory_message(state), from_addr);
            } else {
                tracing::info!(node = %state.self_id, peer = %from, "Lower node claims primary, challenging");
                effects.elect();
            }
            return effects;
        }

        if state.step_down(from) {
            self.stats.lock().step_downs += 1;
            tracing::warn!(node = %state.self_id, peer = %from, "Stepping down for higher primary");
        }
        if !state.adopt(sum, seqn) {
            tracing::info!(
                node = %state.self_id,
                "Keeping local seqn {} over victory seqn {}",
                state.last_seqn,
                seqn
            );
        }
        tracing::info!(node = %state.self_id, peer = %from, "Accepted new primary");

        effects.send(
            Message::VictoryAck {
                sender: state.self_id,
                sum: state.current_sum,
                seqn: state.last_seqn,
            },
            from_addr,
        );
        effects
    }

    /// Handle `VictoryAck`. A backup reporting a newer state than the
    /// primary's hands it over; the next heartbeat spreads it. Seen by a
    /// backup, the reported seqn is not recorded as an ack.
    pub(crate) fn on_victory_ack(
        &self,
        state: &mut ClusterState,
        from: NodeId,
        sum: i64,
        seqn: u64,
    ) -> Effects {
        if state.is_primary() && seqn > state.last_seqn {
            tracing::warn!(
                node = %state.self_id,
                peer = %from,
                "Recovering newer state: sum {} seqn {} (had seqn {})",
                sum,
                seqn,
                state.last_seqn
            );
            state.adopt(sum, seqn);
        }

        if seqn <= state.last_seqn {
            state.directory.record_ack(from, seqn);
        }
        tracing::info!(node = %state.self_id, peer = %from, "Replica acknowledged victory at seqn {}", seqn);
        Effects::default()
    }
}

/// Upper bound for how long a full election can take from detection to
/// announcement, used by callers waiting for a new primary.
pub fn election_deadline(config: &crate::config::ReplicationConfig) -> Duration {
    config.primary_timeout + config.check_interval + config.election_jitter + config.election_timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReplicationConfig, Role};
    use crate::transport::MemoryNetwork;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn node(net: &MemoryNetwork, config: ReplicationConfig) -> Arc<Node> {
        let transport = net.bind(config.bind_addr, config.recv_timeout).unwrap();
        Node::new(config, Arc::new(transport)).unwrap()
    }

    fn backup(net: &MemoryNetwork, id: u32, primary: u32) -> Arc<Node> {
        node(
            net,
            ReplicationConfig::backup(NodeId(id), addr(id as u16 + 2), NodeId(primary), addr(primary as u16 + 2))
                .fast(),
        )
    }

    fn victory(sender: u32, sum: i64, seqn: u64) -> Message {
        Message::Victory {
            sender: NodeId(sender),
            sum,
            seqn,
            timestamp: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_node_wins_immediately() {
        let net = MemoryNetwork::new();
        let node = backup(&net, 2004, 2000);

        assert_eq!(node.start_election().await, ElectionOutcome::Won);
        assert!(node.is_primary());
        assert_eq!(node.primary_id(), Some(NodeId(2004)));
        assert_eq!(node.election_state(), ElectionState::Idle);
        assert_eq!(node.stats().elections_won, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_higher_node_loses_by_default() {
        let net = MemoryNetwork::new();
        // 2008 is seeded (fresh) but nobody listens there
        let node = backup(&net, 2004, 2008);

        let started = Instant::now();
        assert_eq!(node.start_election().await, ElectionOutcome::Won);
        assert!(started.elapsed() >= node.config().election_timeout);
        assert!(node.is_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_election_guard_skips_concurrent_run() {
        let net = MemoryNetwork::new();
        let node = backup(&net, 2004, 2000);
        node.state.lock().begin_election(Instant::now());
        assert_eq!(node.start_election().await, ElectionOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_ends_election_as_lost() {
        let net = MemoryNetwork::new();
        let node = backup(&net, 2004, 2008);

        let contender = node.clone();
        let election = tokio::spawn(async move { contender.start_election().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(node.election_state().is_electing());

        node.handle_message(
            Message::ElectionResponse {
                sender: NodeId(2008),
                timestamp: 0,
            },
            addr(2010),
        );
        assert_eq!(election.await.unwrap(), ElectionOutcome::Lost);
        assert!(!node.is_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_election_from_lower_is_answered() {
        let net = MemoryNetwork::new();
        let node = backup(&net, 2004, 2008);

        let effects = node.handle_message(
            Message::StartElection {
                sender: NodeId(2000),
                timestamp: 0,
            },
            addr(2002),
        );
        assert!(effects.elect);
        assert!(effects.sends.is_empty());
        assert!(matches!(
            effects.replies.as_slice(),
            [(Message::ElectionResponse { sender: NodeId(2004), .. }, _)]
        ));

        let effects = node.handle_message(
            Message::StartElection {
                sender: NodeId(2012),
                timestamp: 0,
            },
            addr(2014),
        );
        assert!(effects.sends.is_empty());
        assert!(effects.replies.is_empty());
        assert!(!effects.elect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_answers_and_reasserts() {
        let net = MemoryNetwork::new();
        let primary = node(&net, ReplicationConfig::primary(NodeId(2000), addr(2002)).fast());

        let effects = primary.handle_message(
            Message::StartElection {
                sender: NodeId(2004),
                timestamp: 0,
            },
            addr(2006),
        );
        assert!(!effects.elect);
        // one answer per challenge copy, the victory itself goes out as a burst
        assert!(matches!(
            effects.replies.as_slice(),
            [(Message::ElectionResponse { sender: NodeId(2000), .. }, _)]
        ));
        assert!(matches!(
            effects.sends.as_slice(),
            [(Message::Victory { sender: NodeId(2000), .. }, _)]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_victory_from_higher_accepted() {
        let net = MemoryNetwork::new();
        let primary = node(&net, ReplicationConfig::primary(NodeId(2000), addr(2002)).fast());
        primary.state.lock().adopt(7, 3);

        let effects = primary.handle_message(victory(2004, 12, 4), addr(2006));
        assert_eq!(primary.role(), Role::Backup);
        assert_eq!(primary.primary_id(), Some(NodeId(2004)));
        assert_eq!(primary.current_sum(), 12);
        assert_eq!(primary.stats().step_downs, 1);
        assert_eq!(
            effects.sends[0].0,
            Message::VictoryAck {
                sender: NodeId(2000),
                sum: 12,
                seqn: 4
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_victory_with_older_seqn_keeps_local_state() {
        let net = MemoryNetwork::new();
        let node = backup(&net, 2000, 1000);
        node.state.lock().adopt(12, 4);

        let effects = node.handle_message(victory(2004, 7, 3), addr(2006));
        assert_eq!(node.primary_id(), Some(NodeId(2004)));
        assert_eq!(node.current_sum(), 12);
        assert_eq!(node.last_seqn(), 4);
        // the ack reports the newer state so the new primary can recover it
        assert_eq!(
            effects.sends[0].0,
            Message::VictoryAck {
                sender: NodeId(2000),
                sum: 12,
                seqn: 4
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_victory_from_lower_is_challenged() {
        let net = MemoryNetwork::new();
        let node = backup(&net, 2004, 2008);
        let effects = node.handle_message(victory(2000, 1, 1), addr(2002));
        assert!(effects.elect);
        assert_eq!(node.primary_id(), Some(NodeId(2008)));

        let primary = self::node(&net, ReplicationConfig::primary(NodeId(3000), addr(3002)).fast());
        let effects = primary.handle_message(victory(2000, 1, 1), addr(2002));
        assert!(primary.is_primary());
        assert!(matches!(effects.sends[0].0, Message::Victory { sender: NodeId(3000), .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_victory_ack_recovers_newer_state() {
        let net = MemoryNetwork::new();
        let primary = node(&net, ReplicationConfig::primary(NodeId(2004), addr(2006)).fast());
        primary.state.lock().adopt(7, 3);

        primary.handle_message(
            Message::VictoryAck {
                sender: NodeId(2000),
                sum: 12,
                seqn: 4,
            },
            addr(2002),
        );
        assert_eq!(primary.current_sum(), 12);
        assert_eq!(primary.last_seqn(), 4);

        let record = primary
            .directory_snapshot()
            .into_iter()
            .find(|r| r.id == NodeId(2000))
            .unwrap();
        assert_eq!(record.acked_seqn, 4);
    }

    #[test]
    fn test_election_deadline() {
        let config = ReplicationConfig::default();
        assert_eq!(election_deadline(&config), Duration::from_millis(11_200));
    }
}
