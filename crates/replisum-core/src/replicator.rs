//! State replication (write path)
//!
//! The primary applies a delta locally, pushes the new `sum`/`seqn` to every
//! live backup and waits up to `2 * request_timeout` for their acks. Missing
//! acks are reported, never rolled back: the write stays committed on the
//! primary and later heartbeats carry it to stragglers.

use crate::directory::NodeId;
use crate::node::{Effects, Node};
use crate::protocol::{Message, now_millis};
use crate::state::ClusterState;
use crate::{Error, Result};
use std::net::SocketAddr;
use tokio::time::Instant;

/// A write applied on the primary, ready to be replicated
struct PendingWrite {
    sum: i64,
    seqn: u64,
    update: Message,
    targets: Vec<(NodeId, SocketAddr)>,
}

impl Node {
    /// Apply `delta` under sequence number `seqn` and replicate it.
    ///
    /// Fails with [`Error::NotPrimary`] on a backup. A `seqn` at or below the
    /// last applied one is a redelivered request: nothing is applied and the
    /// call succeeds. Returns [`Error::ReplicationIncomplete`] when some live
    /// backup did not acknowledge in time; the update is still applied.
    pub async fn update_state(&self, delta: i64, seqn: u64) -> Result<()> {
        match self.apply_write(delta, Some(seqn))? {
            Some(write) => self.replicate(write).await,
            None => Ok(()),
        }
    }

    /// Apply `delta` under the next sequence number and replicate it.
    ///
    /// Returns the new `(sum, seqn)`.
    pub async fn add(&self, delta: i64) -> Result<(i64, u64)> {
        let Some(write) = self.apply_write(delta, None)? else {
            return Ok((self.current_sum(), self.last_seqn()));
        };
        let applied = (write.sum, write.seqn);
        self.replicate(write).await?;
        Ok(applied)
    }

    fn apply_write(&self, delta: i64, seqn: Option<u64>) -> Result<Option<PendingWrite>> {
        let mut state = self.state.lock();
        if !state.is_primary() {
            return Err(Error::NotPrimary {
                primary: state.primary_id,
            });
        }

        let seqn = match seqn {
            Some(seqn) if seqn <= state.last_seqn => {
                tracing::debug!(
                    node = %state.self_id,
                    "Ignoring duplicate update seqn {} (last {})",
                    seqn,
                    state.last_seqn
                );
                return Ok(None);
            }
            Some(seqn) => seqn,
            None => state.last_seqn + 1,
        };

        state.apply_delta(delta, seqn);
        tracing::debug!(
            node = %state.self_id,
            "Applied delta {}: sum {} seqn {}",
            delta,
            state.current_sum,
            seqn
        );

        Ok(Some(PendingWrite {
            sum: state.current_sum,
            seqn,
            update: Message::StateUpdate {
                sender: state.self_id,
                sum: state.current_sum,
                seqn,
                timestamp: now_millis(),
            },
            targets: state.directory.alive_peers(state.self_id),
        }))
    }

    async fn replicate(&self, write: PendingWrite) -> Result<()> {
        self.stats.lock().updates_replicated += 1;
        let (_, acked) = tokio::join!(
            self.broadcast(&write.update, &write.targets, self.config.retry),
            self.wait_for_acks(write.seqn)
        );
        acked
    }

    /// Poll until every live backup acknowledged `seqn` or the ack window closes
    async fn wait_for_acks(&self, seqn: u64) -> Result<()> {
        let deadline = Instant::now() + self.config.ack_timeout();

        loop {
            let missing: Vec<NodeId> = {
                let state = self.state.lock();
                state
                    .directory
                    .snapshot()
                    .into_iter()
                    .filter(|r| r.id != state.self_id && r.is_alive && r.acked_seqn < seqn)
                    .map(|r| r.id)
                    .collect()
            };

            if missing.is_empty() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                self.stats.lock().incomplete_replications += 1;
                tracing::warn!(
                    node = %self.config.node_id,
                    "Replication incomplete for seqn {}: no ack from {:?}",
                    seqn,
                    missing
                );
                return Err(Error::ReplicationIncomplete { seqn, missing });
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Shutdown),
                _ = tokio::time::sleep(self.config.ack_poll_interval) => {}
            }
        }
    }

    /// Handle `StateUpdate` on a backup. Updates from anyone but the known
    /// primary are dropped without an ack; everything else is acked, applied
    /// or not, so the primary stops waiting. A stale update is also answered
    /// with a `VictoryAck` carrying the newer local state, which the primary
    /// adopts.
    pub(crate) fn on_state_update(
        &self,
        state: &mut ClusterState,
        from: NodeId,
        sum: i64,
        seqn: u64,
    ) -> Effects {
        let mut effects = Effects::default();

        if state.primary_id.is_none() && !state.is_primary() {
            tracing::info!(node = %state.self_id, peer = %from, "Adopting update sender as primary");
            state.primary_id = Some(from);
        }

        if state.primary_id != Some(from) {
            self.stats.lock().rejected_updates += 1;
            tracing::debug!(
                node = %state.self_id,
                peer = %from,
                "Rejecting update from non-primary (primary {:?})",
                state.primary_id
            );
            return effects;
        }

        let Some(addr) = state.directory.addr_of(from) else {
            return effects;
        };

        if state.adopt(sum, seqn) {
            tracing::debug!(node = %state.self_id, "Replicated sum {} seqn {}", sum, seqn);
        } else {
            self.stats.lock().stale_updates_ignored += 1;
            tracing::debug!(
                node = %state.self_id,
                "Ignoring stale update seqn {} (last {})",
                seqn,
                state.last_seqn
            );
            effects.reply(
                Message::VictoryAck {
                    sender: state.self_id,
                    sum: state.current_sum,
                    seqn: state.last_seqn,
                },
                addr,
            );
        }

        effects.reply(
            Message::StateAck {
                sender: state.self_id,
                seqn,
            },
            addr,
        );
        effects
    }

    /// Handle `StateAck`. An ack beyond the local seqn describes a state
    /// this node never produced and is not recorded.
    pub(crate) fn on_state_ack(&self, state: &mut ClusterState, from: NodeId, seqn: u64) -> Effects {
        if seqn > state.last_seqn {
            tracing::debug!(
                node = %state.self_id,
                peer = %from,
                "Ignoring ack for seqn {} beyond local seqn {}",
                seqn,
                state.last_seqn
            );
            return Effects::default();
        }
        state.directory.record_ack(from, seqn);
        tracing::trace!(node = %state.self_id, peer = %from, "Ack for seqn {}", seqn);
        Effects::default()
    }
}
