//! Replica node
//!
//! A node owns one [`ClusterState`] behind a mutex and runs four tasks over
//! it: the receiver loop, the heartbeat broadcaster, the failure detector,
//! and (for backups) the initial join. Message handlers are synchronous:
//! they mutate the state under the lock and return [`Effects`] that the
//! receiver loop carries out after the lock is released.

use crate::config::{ReplicationConfig, Role};
use crate::directory::{NodeId, ReplicaRecord};
use crate::protocol::Message;
use crate::retry::RetryPolicy;
use crate::state::{ClusterState, ElectionState};
use crate::transport::{Transport, UdpTransport};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Node statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Messages decoded and dispatched
    pub messages_received: u64,
    /// Datagrams dropped by the codec
    pub decode_errors: u64,
    /// Heartbeats sent (one per target)
    pub heartbeats_sent: u64,
    /// Updates applied and broadcast as primary
    pub updates_replicated: u64,
    /// Updates not acknowledged by every live backup in time
    pub incomplete_replications: u64,
    /// State updates ignored because the local state was fresher
    pub stale_updates_ignored: u64,
    /// State updates rejected because the sender is not our primary
    pub rejected_updates: u64,
    /// Join requests served as primary
    pub joins_handled: u64,
    /// Elections started by this node
    pub elections_started: u64,
    /// Elections won by this node
    pub elections_won: u64,
    /// Times this node gave up the primary role
    pub step_downs: u64,
}

/// Sends and follow-up work produced by a message handler
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Sent as a burst of `config.retry` copies
    pub(crate) sends: Vec<(Message, SocketAddr)>,
    /// Answers to an incoming message, sent once each
    pub(crate) replies: Vec<(Message, SocketAddr)>,
    pub(crate) elect: bool,
}

impl Effects {
    pub(crate) fn send(&mut self, msg: Message, addr: SocketAddr) {
        self.sends.push((msg, addr));
    }

    /// Answer a message that itself arrives in bursts
    pub(crate) fn reply(&mut self, msg: Message, addr: SocketAddr) {
        self.replies.push((msg, addr));
    }

    pub(crate) fn broadcast(&mut self, msg: &Message, targets: &[(NodeId, SocketAddr)]) {
        for (_, addr) in targets {
            self.sends.push((msg.clone(), *addr));
        }
    }

    pub(crate) fn elect(&mut self) {
        self.elect = true;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.replies.is_empty() && !self.elect
    }
}

/// A member of the replicated accumulator cluster
pub struct Node {
    pub(crate) config: ReplicationConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) state: Mutex<ClusterState>,
    pub(crate) stats: Mutex<NodeStats>,
    pub(crate) cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Node {
    /// Create a node on top of `transport`.
    ///
    /// The directory is seeded with this node and the configured peers.
    pub fn new(config: ReplicationConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate().map_err(Error::config)?;

        let now = Instant::now();
        let mut state = ClusterState::new(
            config.node_id,
            config.role,
            config.primary_id,
            config.max_replicas,
        );
        state
            .directory
            .upsert(config.node_id, transport.local_addr(), now)?;
        for peer in &config.peers {
            state.directory.upsert(peer.id, peer.addr, now)?;
        }

        Ok(Arc::new(Self {
            config,
            transport,
            state: Mutex::new(state),
            stats: Mutex::new(NodeStats::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    /// Create a node with a UDP socket bound on `config.bind_addr`
    pub async fn bind_udp(config: ReplicationConfig) -> Result<Arc<Self>> {
        let transport = UdpTransport::bind(config.bind_addr, config.recv_timeout).await?;
        Self::new(config, Arc::new(transport))
    }

    /// Spawn the node's background tasks
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::config("Node already started"));
        }

        let role = self.role();
        tracing::info!(
            node = %self.config.node_id,
            addr = %self.transport.local_addr(),
            "Node starting as {:?} (primary: {:?})",
            role,
            self.primary_id()
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().receive_loop()));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));
        tasks.push(tokio::spawn(self.clone().failure_detector_loop()));
        if role == Role::Backup {
            tasks.push(tokio::spawn(self.clone().join_loop()));
        }
        Ok(())
    }

    /// Stop all tasks and close the transport
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.transport.close();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Node task failed: {}", e);
            }
        }
        tracing::info!(node = %self.config.node_id, "Node stopped");
    }

    /// True while the node's tasks are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// This node's identifier
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Replication endpoint of this node
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Configuration the node was built with
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// True if this node currently accepts writes
    pub fn is_primary(&self) -> bool {
        self.state.lock().is_primary()
    }

    /// Current role
    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    /// Primary this node believes in
    pub fn primary_id(&self) -> Option<NodeId> {
        self.state.lock().primary_id
    }

    /// Replication address of the believed primary, if known
    pub fn primary_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        state.primary_id.and_then(|id| state.directory.addr_of(id))
    }

    /// Current accumulator value
    pub fn current_sum(&self) -> i64 {
        self.state.lock().current_sum
    }

    /// Sequence number of the last applied update
    pub fn last_seqn(&self) -> u64 {
        self.state.lock().last_seqn
    }

    /// True once this node holds state from a primary (always true on a primary)
    pub fn has_initial_state(&self) -> bool {
        self.state.lock().received_initial_state
    }

    /// Election state machine
    pub fn election_state(&self) -> ElectionState {
        self.state.lock().election
    }

    /// Copy of the replica directory
    pub fn directory_snapshot(&self) -> Vec<ReplicaRecord> {
        self.state.lock().directory.snapshot()
    }

    /// Get statistics
    pub fn stats(&self) -> NodeStats {
        self.stats.lock().clone()
    }

    /// Receive and dispatch messages until shutdown
    async fn receive_loop(self: Arc<Self>) {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.transport.recv() => received,
            };

            match received {
                Ok(Some((msg, from))) => {
                    let effects = self.handle_message(msg, from);
                    self.apply(effects);
                }
                Ok(None) => {}
                Err(Error::Shutdown) => break,
                Err(Error::Codec(e)) => {
                    self.stats.lock().decode_errors += 1;
                    tracing::warn!(node = %self.config.node_id, "Dropping corrupt datagram: {}", e);
                }
                Err(e) => {
                    tracing::debug!(node = %self.config.node_id, "Receive error: {}", e);
                }
            }
        }
        tracing::debug!(node = %self.config.node_id, "Receiver loop exited");
    }

    /// Route one message to its handler.
    ///
    /// The sender is registered (or refreshed) in the directory first, so
    /// any traffic counts as a liveness signal.
    pub(crate) fn handle_message(&self, msg: Message, from: SocketAddr) -> Effects {
        let now = Instant::now();
        let sender = msg.sender();
        let mut state = self.state.lock();

        if sender == state.self_id {
            return Effects::default();
        }

        let newly_added = state.directory.get(sender).is_none();
        let registered = match state.directory.upsert(sender, from, now) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(node = %state.self_id, peer = %sender, "Cannot register peer at {}: {}", from, e);
                false
            }
        };
        self.stats.lock().messages_received += 1;

        tracing::trace!(node = %state.self_id, peer = %sender, "Received {:?}", msg.message_type());

        match msg {
            Message::Heartbeat { sum, seqn, .. } => {
                self.on_heartbeat(&mut state, sender, sum, seqn, now)
            }
            Message::JoinRequest { .. } => {
                if !registered {
                    return Effects::default();
                }
                self.on_join_request(&mut state, sender, newly_added, now)
            }
            Message::StateUpdate { sum, seqn, .. } => {
                self.on_state_update(&mut state, sender, sum, seqn)
            }
            Message::StateAck { seqn, .. } => self.on_state_ack(&mut state, sender, seqn),
            Message::ReplicaListUpdate {
                primary, replicas, ..
            } => self.on_replica_list(&mut state, sender, primary, &replicas, now),
            Message::StartElection { .. } => self.on_start_election(&mut state, sender),
            Message::ElectionResponse { .. } => self.on_election_response(&mut state, sender),
            Message::Victory { sum, seqn, .. } => self.on_victory(&mut state, sender, sum, seqn),
            Message::VictoryAck { sum, seqn, .. } => {
                self.on_victory_ack(&mut state, sender, sum, seqn)
            }
        }
    }

    /// Carry out handler effects without blocking the receiver loop
    pub(crate) fn apply(self: &Arc<Self>, effects: Effects) {
        if effects.is_empty() {
            return;
        }

        let Effects {
            sends,
            replies,
            elect,
        } = effects;
        if !sends.is_empty() || !replies.is_empty() {
            let node = self.clone();
            tokio::spawn(async move {
                let bursts = sends
                    .iter()
                    .map(|msg| (msg, node.config.retry))
                    .chain(replies.iter().map(|msg| (msg, RetryPolicy::single())))
                    .map(|((msg, addr), policy)| node.send_burst(msg, *addr, policy));
                futures::future::join_all(bursts).await;
            });
        }
        if elect {
            let node = self.clone();
            tokio::spawn(async move {
                node.start_election().await;
            });
        }
    }

    /// Send `msg` to `addr` as a burst of copies per `policy`
    pub(crate) async fn send_burst(&self, msg: &Message, addr: SocketAddr, policy: RetryPolicy) {
        for attempt in 1..=policy.attempts() {
            match self.transport.send_to(msg, addr).await {
                Ok(()) => {}
                Err(Error::Shutdown) => return,
                Err(e) if e.is_retryable() => {
                    tracing::debug!(node = %self.config.node_id, "Send to {} failed: {}", addr, e);
                }
                Err(e) => {
                    tracing::warn!(node = %self.config.node_id, "Cannot send {:?} to {}: {}", msg.message_type(), addr, e);
                    return;
                }
            }

            let delay = policy.delay_after(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Burst `msg` to every target concurrently
    pub(crate) async fn broadcast(
        &self,
        msg: &Message,
        targets: &[(NodeId, SocketAddr)],
        policy: RetryPolicy,
    ) {
        let sends = targets
            .iter()
            .map(|(_, addr)| self.send_burst(msg, *addr, policy));
        futures::future::join_all(sends).await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.config.node_id)
            .field("addr", &self.transport.local_addr())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn backup(net: &MemoryNetwork) -> Arc<Node> {
        let config = ReplicationConfig::backup(NodeId(2004), addr(2006), NodeId(2000), addr(2002)).fast();
        let transport = net.bind(addr(2006), config.recv_timeout).unwrap();
        Node::new(config, Arc::new(transport)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_node_seeds_directory() {
        let net = MemoryNetwork::new();
        let node = backup(&net);

        let ids: Vec<_> = node.directory_snapshot().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![NodeId(2000), NodeId(2004)]);
        assert_eq!(node.primary_id(), Some(NodeId(2000)));
        assert_eq!(node.primary_addr(), Some(addr(2002)));
        assert!(!node.is_primary());
        assert!(!node.has_initial_state());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let net = MemoryNetwork::new();
        let mut config = ReplicationConfig::primary(NodeId(1), addr(1));
        config.max_replicas = 0;
        let transport = net.bind(addr(1), Duration::from_millis(10)).unwrap();
        let err = Node::new(config, Arc::new(transport)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_message_refreshes_sender() {
        let net = MemoryNetwork::new();
        let node = backup(&net);
        let later = Instant::now() + Duration::from_secs(1);
        tokio::time::advance(Duration::from_secs(1)).await;

        // an unknown peer shows up with a stray ack
        node.handle_message(
            Message::StateAck {
                sender: NodeId(2008),
                seqn: 0,
            },
            addr(2010),
        );

        let record = node
            .directory_snapshot()
            .into_iter()
            .find(|r| r.id == NodeId(2008))
            .unwrap();
        assert!(record.is_alive);
        assert_eq!(record.addr, addr(2010));
        assert!(record.last_heartbeat >= later);
        assert_eq!(node.stats().messages_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_messages_ignored() {
        let net = MemoryNetwork::new();
        let node = backup(&net);
        let effects = node.handle_message(
            Message::Victory {
                sender: NodeId(2004),
                sum: 1,
                seqn: 1,
                timestamp: 0,
            },
            addr(2006),
        );
        assert!(effects.is_empty());
        assert_eq!(node.stats().messages_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_fails_and_shutdown_is_idempotent() {
        let net = MemoryNetwork::new();
        let node = backup(&net);
        node.start().unwrap();
        assert!(node.start().is_err());
        node.shutdown().await;
        assert!(!node.is_running());
        node.shutdown().await;
    }
}
