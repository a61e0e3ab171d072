//! Cluster integration tests
//!
//! Whole clusters running over the in-memory network with a paused clock:
//! - Join bootstrapping and replicated writes
//! - Failover to a backup that keeps the replicated state
//! - Bully elections converging on the highest identifier
//! - Split-brain correction after a healed partition, keeping the fresher state
//! - Convergence over a lossy network

use replisum_core::election::election_deadline;
use replisum_core::{
    ElectionOutcome, Error, MemoryNetwork, Message, Node, NodeId, ReplicationConfig, Role,
    Transport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn addr(id: u32) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], id as u16 + 2))
}

fn primary_config(id: u32) -> ReplicationConfig {
    ReplicationConfig::primary(NodeId(id), addr(id)).fast()
}

fn backup_config(id: u32, primary: u32) -> ReplicationConfig {
    ReplicationConfig::backup(NodeId(id), addr(id), NodeId(primary), addr(primary)).fast()
}

fn start(net: &MemoryNetwork, config: ReplicationConfig) -> Arc<Node> {
    let transport = net.bind(config.bind_addr, config.recv_timeout).unwrap();
    let node = Node::new(config, Arc::new(transport)).unwrap();
    node.start().unwrap();
    node
}

/// Poll `check` every 10ms until it holds or `timeout` passes
async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn joined(backup: &Node) -> bool {
    wait_until(Duration::from_secs(2), || backup.has_initial_state()).await
}

#[tokio::test(start_paused = true)]
async fn test_join_bootstraps_state() {
    let net = MemoryNetwork::new();
    let primary = start(&net, primary_config(2000));
    primary.add(3).await.unwrap();
    primary.add(4).await.unwrap();

    let backup = start(&net, backup_config(2004, 2000));
    assert!(joined(&backup).await);
    assert_eq!(backup.current_sum(), 7);
    assert_eq!(backup.last_seqn(), 2);

    let record = primary
        .directory_snapshot()
        .into_iter()
        .find(|r| r.id == NodeId(2004))
        .expect("backup registered at primary");
    assert!(record.is_alive);
    assert_eq!(record.addr, addr(2004));
    assert_eq!(primary.stats().joins_handled, 1);

    primary.shutdown().await;
    backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_writes_are_acknowledged_by_backups() {
    let net = MemoryNetwork::new();
    let primary = start(&net, primary_config(2000));
    let b1 = start(&net, backup_config(1000, 2000));
    let b2 = start(&net, backup_config(1500, 2000));
    assert!(joined(&b1).await && joined(&b2).await);

    for value in [1, 2, 3, 4] {
        primary.add(value).await.unwrap();
    }
    assert_eq!(primary.current_sum(), 10);
    assert_eq!(b1.current_sum(), 10);
    assert_eq!(b2.last_seqn(), 4);
    assert_eq!(primary.stats().incomplete_replications, 0);

    let err = b1.update_state(1, 5).await.unwrap_err();
    assert!(matches!(err, Error::NotPrimary { primary: Some(NodeId(2000)) }));

    for node in [&primary, &b1, &b2] {
        node.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_failover_keeps_replicated_state() {
    let net = MemoryNetwork::new();
    let primary = start(&net, primary_config(2000));
    let backup = start(&net, backup_config(2004, 2000));
    assert!(joined(&backup).await);

    primary.update_state(3, 1).await.unwrap();
    primary.update_state(2, 2).await.unwrap();
    primary.update_state(2, 3).await.unwrap();
    assert_eq!((backup.current_sum(), backup.last_seqn()), (7, 3));

    // primary crashes
    primary.shutdown().await;
    let crashed_at = Instant::now();

    let deadline = election_deadline(backup.config()) + Duration::from_millis(200);
    assert!(wait_until(deadline, || backup.is_primary()).await);
    assert!(crashed_at.elapsed() >= backup.config().primary_timeout);
    assert_eq!(backup.primary_id(), Some(NodeId(2004)));
    assert_eq!((backup.current_sum(), backup.last_seqn()), (7, 3));
    assert_eq!(backup.stats().elections_won, 1);

    // let the broadcaster expire the dead primary
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backup.add(5).await.unwrap(), (12, 4));

    backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_primary_replicates_to_remaining_backups() {
    let net = MemoryNetwork::new();
    let primary = start(&net, primary_config(3000));
    let b1 = start(&net, backup_config(2000, 3000));
    assert!(joined(&b1).await);
    let b2 = start(&net, backup_config(2004, 3000));
    assert!(joined(&b2).await);
    primary.add(7).await.unwrap();

    primary.shutdown().await;

    let deadline = election_deadline(b1.config()) * 2;
    assert!(
        wait_until(deadline, || {
            b2.is_primary() && b1.primary_id() == Some(NodeId(2004)) && !b1.is_primary()
        })
        .await
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(b2.add(5).await.unwrap(), (12, 2));
    assert_eq!((b1.current_sum(), b1.last_seqn()), (12, 2));

    b1.shutdown().await;
    b2.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_highest_id_wins_regardless_of_initiator() {
    let net = MemoryNetwork::new();
    let n1 = start(&net, primary_config(1));
    let n2 = start(&net, backup_config(2, 1));
    assert!(joined(&n2).await);
    let n3 = start(&net, backup_config(3, 1));
    assert!(joined(&n3).await);

    // node 2 learned about node 3 through the primary's replica list
    assert!(n2.directory_snapshot().iter().any(|r| r.id == NodeId(3)));

    assert_eq!(n2.start_election().await, ElectionOutcome::Lost);

    let converged = wait_until(Duration::from_secs(2), || {
        n3.is_primary()
            && [&n1, &n2, &n3]
                .iter()
                .all(|n| n.primary_id() == Some(NodeId(3)))
    })
    .await;
    assert!(converged);
    assert_eq!(n1.role(), Role::Backup);
    assert_eq!(n1.stats().step_downs, 1);

    for node in [&n1, &n2, &n3] {
        node.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_lone_node_wins_by_default() {
    let net = MemoryNetwork::new();
    // the configured primary never comes up
    let node = start(&net, backup_config(2004, 2000));

    let started = Instant::now();
    let deadline = election_deadline(node.config()) + Duration::from_millis(200);
    assert!(wait_until(deadline, || node.is_primary()).await);
    assert!(started.elapsed() >= node.config().primary_timeout);
    assert_eq!(node.primary_id(), Some(NodeId(2004)));

    node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_state_update_is_idempotent() {
    let net = MemoryNetwork::new();
    // a hand-driven primary endpoint
    let fake_primary = net.bind(addr(9000), Duration::from_millis(50)).unwrap();
    let backup = start(&net, backup_config(2004, 9000));

    let update = Message::StateUpdate {
        sender: NodeId(9000),
        sum: 5,
        seqn: 10,
        timestamp: 0,
    };
    fake_primary.send_to(&update, addr(2004)).await.unwrap();
    fake_primary.send_to(&update, addr(2004)).await.unwrap();

    assert!(wait_until(Duration::from_millis(500), || backup.last_seqn() == 10).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backup.current_sum(), 5);
    assert_eq!(backup.last_seqn(), 10);

    // every copy is acknowledged once, applied or not
    let mut acks = 0;
    while let Ok(Some((msg, _))) = fake_primary.recv().await {
        if msg == (Message::StateAck { sender: NodeId(2004), seqn: 10 }) {
            acks += 1;
        }
    }
    assert_eq!(acks, 2);

    backup.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_primary_steps_down_after_partition_heals() {
    let net = MemoryNetwork::new();
    let old = start(&net, primary_config(2000));
    let new = start(&net, backup_config(2004, 2000));
    assert!(joined(&new).await);
    old.add(7).await.unwrap();

    net.partition(addr(2000), addr(2004));
    let deadline = election_deadline(new.config()) + Duration::from_millis(200);
    assert!(wait_until(deadline, || new.is_primary()).await);
    // both believe they lead while the partition lasts
    assert!(old.is_primary());
    assert!(matches!(
        old.add(1).await,
        Err(Error::ReplicationIncomplete { .. }) | Ok(_)
    ));

    net.heal(addr(2000), addr(2004));
    let healed = wait_until(Duration::from_secs(2), || {
        !old.is_primary() && old.primary_id() == Some(NodeId(2004))
    })
    .await;
    assert!(healed);
    assert!(new.is_primary());
    assert_eq!(old.stats().step_downs, 1);

    old.shutdown().await;
    new.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fresher_state_survives_partition_heal() {
    let net = MemoryNetwork::new();
    let old = start(&net, primary_config(2000));
    let new = start(&net, backup_config(2004, 2000));
    assert!(joined(&new).await);
    old.add(7).await.unwrap();

    net.partition(addr(2000), addr(2004));
    let deadline = election_deadline(new.config()) + Duration::from_millis(200);
    assert!(wait_until(deadline, || new.is_primary()).await);

    // the stale side keeps taking writes and ends up ahead
    for value in [10, 10, 4] {
        let _ = old.add(value).await;
    }
    assert_eq!((old.current_sum(), old.last_seqn()), (31, 4));
    assert_eq!(new.last_seqn(), 1);

    net.heal(addr(2000), addr(2004));
    let handed_over = wait_until(Duration::from_secs(2), || {
        !old.is_primary() && new.is_primary() && new.last_seqn() == 4
    })
    .await;
    assert!(handed_over);
    assert_eq!(new.current_sum(), 31);

    // the next write is acknowledged for its own seqn and lands on both
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(new.add(5).await.unwrap(), (36, 5));
    assert_eq!((old.current_sum(), old.last_seqn()), (36, 5));

    old.shutdown().await;
    new.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backups_converge_over_lossy_network() {
    let net = MemoryNetwork::new();
    let primary = start(&net, primary_config(2000));
    let b1 = start(&net, backup_config(1000, 2000));
    let b2 = start(&net, backup_config(1500, 2000));
    assert!(joined(&b1).await && joined(&b2).await);

    net.set_drop_probability(0.2);
    for value in 1..=20 {
        match primary.add(value).await {
            Ok(_) | Err(Error::ReplicationIncomplete { .. }) => {}
            Err(e) => panic!("unexpected write failure: {}", e),
        }
    }
    net.set_drop_probability(0.0);

    let expected = (1..=20).sum::<i64>();
    assert_eq!(primary.current_sum(), expected);
    let converged = wait_until(Duration::from_secs(3), || {
        primary.is_primary()
            && [&b1, &b2]
                .iter()
                .all(|b| b.current_sum() == expected && b.last_seqn() == 20)
    })
    .await;
    assert!(converged);

    for node in [&primary, &b1, &b2] {
        node.shutdown().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_discovered_replica_is_registered() {
    let net = MemoryNetwork::new();
    let primary = start(&net, primary_config(2000));
    let mut config = backup_config(2004, 2000);
    config.primary_id = None;
    config.peers.clear();
    let stray = start(&net, config);

    // external discovery hands the stray node the primary's address
    stray.add_discovered_replica(addr(2000)).await;

    assert!(joined(&stray).await);
    assert_eq!(stray.primary_id(), Some(NodeId(2000)));
    assert!(primary.directory_snapshot().iter().any(|r| r.id == NodeId(2004)));

    primary.shutdown().await;
    stray.shutdown().await;
}
