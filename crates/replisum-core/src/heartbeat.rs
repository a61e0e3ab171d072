//! Heartbeat broadcaster and failure detector
//!
//! Both loops run for the whole life of the node and check the role on every
//! tick, so a node changing role needs no task restart: the broadcaster only
//! acts while primary, the detector only while backup.

use crate::directory::NodeId;
use crate::node::{Effects, Node};
use crate::protocol::{Message, now_millis};
use crate::retry::RetryPolicy;
use crate::state::{ClusterState, ElectionState};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};

impl Node {
    /// Primary side: send `Heartbeat{sum, seqn}` to every live backup each
    /// `heartbeat_interval`, and mark backups dead after `primary_timeout`
    /// of silence.
    ///
    /// Once per `primary_timeout` the heartbeat also goes to peers marked
    /// dead, so two primaries left over from a healed partition find each
    /// other.
    pub(crate) async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_every = (self.config.primary_timeout.as_millis()
            / self.config.heartbeat_interval.as_millis().max(1))
        .max(1) as u64;
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tick += 1;

            let now = Instant::now();
            let (msg, targets) = {
                let mut state = self.state.lock();
                if !state.is_primary() {
                    continue;
                }

                let self_id = state.self_id;
                let expired = state
                    .directory
                    .expire(self_id, now, self.config.primary_timeout);
                for id in expired {
                    tracing::warn!(node = %self_id, peer = %id, "Backup silent, marking dead");
                }

                let msg = Message::Heartbeat {
                    sender: self_id,
                    sum: state.current_sum,
                    seqn: state.last_seqn,
                    timestamp: now_millis(),
                };
                let targets = if tick % sweep_every == 0 {
                    state.directory.known_peers(self_id)
                } else {
                    state.directory.alive_peers(self_id)
                };
                (msg, targets)
            };

            if targets.is_empty() {
                continue;
            }
            tracing::trace!(node = %self.config.node_id, "Heartbeat to {} backups", targets.len());
            // periodic, so a lost heartbeat is simply replaced by the next one
            self.broadcast(&msg, &targets, RetryPolicy::single()).await;
            self.stats.lock().heartbeats_sent += targets.len() as u64;
        }
    }

    /// Backup side: every `check_interval`, start an election when the
    /// primary is unknown, dead, or silent for longer than `primary_timeout`.
    pub(crate) async fn failure_detector_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !self.primary_suspected() {
                continue;
            }

            let backoff = RetryPolicy::election_backoff(self.config.node_id, self.config.election_jitter);
            tracing::warn!(
                node = %self.config.node_id,
                "Primary {:?} unreachable, electing in {:?}",
                self.primary_id(),
                backoff
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }

            // a victory may have arrived during the backoff
            if self.primary_suspected() {
                self.start_election().await;
            }
        }
    }

    fn primary_suspected(&self) -> bool {
        let state = self.state.lock();
        !state.is_primary()
            && !state.election.is_electing()
            && !state.directory.is_primary_alive(
                state.primary_id,
                Instant::now(),
                self.config.primary_timeout,
            )
    }

    /// Handle a `Heartbeat` from `from`.
    ///
    /// A backup refreshes its view of the primary, catches up if the
    /// heartbeat carries a fresher state, and answers with a `StateAck` so
    /// the primary keeps it alive. A primary hearing a higher primary steps
    /// down; hearing a lower one, it reasserts itself with a `Victory`.
    ///
    /// A node holding a fresher state than the heartbeat, such as a primary
    /// that just stepped down, answers with a `VictoryAck` carrying that
    /// state so the primary adopts it.
    pub(crate) fn on_heartbeat(
        &self,
        state: &mut ClusterState,
        from: NodeId,
        sum: i64,
        seqn: u64,
        now: Instant,
    ) -> Effects {
        let mut effects = Effects::default();
        let Some(from_addr) = state.directory.addr_of(from) else {
            return effects;
        };

        if state.is_primary() {
            if from < state.self_id {
                tracing::warn!(node = %state.self_id, peer = %from, "Heartbeat from lower primary, reasserting");
                effects.send(self.victory_message(state), from_addr);
                return effects;
            }
            state.step_down(from);
            self.stats.lock().step_downs += 1;
            tracing::warn!(node = %state.self_id, peer = %from, "Higher primary alive, stepping down");
        } else if state.primary_id != Some(from) {
            let current_alive = state.directory.is_primary_alive(
                state.primary_id,
                now,
                self.config.primary_timeout,
            );
            let outranks = state.primary_id.is_none_or(|p| from > p);
            if current_alive && !outranks {
                tracing::debug!(node = %state.self_id, peer = %from, "Ignoring heartbeat from non-primary");
                return effects;
            }
            tracing::info!(node = %state.self_id, peer = %from, "Following primary (was {:?})", state.primary_id);
            state.primary_id = Some(from);
        }

        if from > state.self_id {
            state.election = ElectionState::Idle;
        }

        if seqn > state.last_seqn {
            state.adopt(sum, seqn);
            tracing::debug!(node = %state.self_id, "Caught up from heartbeat: sum {} seqn {}", sum, seqn);
        }

        if state.last_seqn > seqn {
            tracing::info!(
                node = %state.self_id,
                peer = %from,
                "Ahead of primary at seqn {} (primary at {}), handing over state",
                state.last_seqn,
                seqn
            );
            effects.send(
                Message::VictoryAck {
                    sender: state.self_id,
                    sum: state.current_sum,
                    seqn: state.last_seqn,
                },
                from_addr,
            );
        } else {
            effects.reply(
                Message::StateAck {
                    sender: state.self_id,
                    seqn: state.last_seqn,
                },
                from_addr,
            );
        }
        effects
    }
}
