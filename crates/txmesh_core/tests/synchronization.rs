//! Integration tests for discovery and journal-replay synchronization.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use txmesh_core::{
    ClusterError, ClusterEvent, ClusterListener, ClusterTransport, DistributedCounter,
    ListenerResult, SyncState,
};
use txmesh_protocol::{
    ProtocolOp, RemoteOp, Request, ResourceId, TaskStatus, Transaction, TxId,
};
use txmesh_testkit::prelude::*;

const SETTLE: Duration = Duration::from_secs(5);

fn blocks() -> ResourceId {
    ResourceId::from(TEST_RESOURCE)
}

fn is_fetch(op: &RemoteOp) -> bool {
    matches!(op, RemoteOp::FetchJournal { .. })
}

/// Records every sync state transition.
#[derive(Default)]
struct TransitionRecorder {
    transitions: Mutex<Vec<(SyncState, SyncState)>>,
}

impl TransitionRecorder {
    fn transitions(&self) -> Vec<(SyncState, SyncState)> {
        self.transitions.lock().clone()
    }
}

impl ClusterListener for TransitionRecorder {
    fn on_event(&self, event: &ClusterEvent) -> ListenerResult {
        if let ClusterEvent::ResMgrStateChanged { from, to, .. } = event {
            self.transitions.lock().push((*from, *to));
        }
        Ok(())
    }
}

/// Commits `count` transactions from `node` and returns their ids.
fn commit_many(node: &TestNode, count: u8) -> Vec<TxId> {
    (0..count)
        .map(|payload| {
            let task_id = node.manager.submit(blocks(), vec![payload]).unwrap();
            assert!(wait_until(SETTLE, || node
                .manager
                .task(task_id)
                .is_some_and(|t| t.status == TaskStatus::Committed)));
            node.manager.task(task_id).unwrap().tx_id.unwrap()
        })
        .collect()
}

#[test]
fn lone_node_stays_undetermined() {
    let cluster = TestCluster::new(3);
    cluster.start(0);

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(cluster.node(0).state(), Some(SyncState::Undetermined));
    assert_eq!(cluster.node(0).rm.post_sync_runs(), 0);
}

#[test]
fn discovery_from_a_minority_does_not_advance() {
    let cluster = TestCluster::new(3);
    cluster.start(0);

    let manager = &cluster.node(0).manager;
    let targets: Vec<_> = cluster.nodes.iter().map(|n| n.node.clone()).collect();
    let known = BTreeMap::from([(blocks(), TxId::NONE)]);
    let outcome = manager.discover_res_mgr_status(&known, &targets).unwrap();

    // Only the local node answered
    assert_eq!(outcome.response_count, 1);
    assert!(!outcome.quorum);
    assert_eq!(outcome.cluster_max(&blocks()), TxId::NONE);
    assert_eq!(cluster.node(0).state(), Some(SyncState::Undetermined));
}

#[test]
fn discovery_reports_every_responder() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    let ids = commit_many(cluster.node(0), 2);

    let manager = &cluster.node(1).manager;
    let targets: Vec<_> = cluster.nodes.iter().map(|n| n.node.clone()).collect();
    let outcome = manager
        .discover_res_mgr_status(&BTreeMap::new(), &targets)
        .unwrap();

    assert_eq!(outcome.response_count, 3);
    assert!(outcome.quorum);
    assert_eq!(outcome.cluster_max(&blocks()), ids[1]);
    let view = manager.cluster_view(&blocks());
    assert!(view.values().all(|last| *last == ids[1]));
    assert_eq!(manager.peers_reflecting(&blocks(), ids[1]), 3);
}

#[test]
fn late_node_catches_up_through_replay() {
    let cluster = TestCluster::new(3);
    cluster.start(0);
    cluster.start(1);
    assert!(cluster.wait_online(2, SETTLE));
    assert!(cluster.wait_up_to_date(&[0, 1], SETTLE));

    let ids = commit_many(cluster.node(0), 3);

    let late = cluster.node(2);
    let recorder = Arc::new(TransitionRecorder::default());
    late.manager.subscribe(recorder.clone()).unwrap();
    cluster.start(2);

    let mut seen = late.manager.last_complete_tx_id();
    assert!(wait_until(SETTLE, || {
        let current = late.manager.last_complete_tx_id();
        assert!(current >= seen, "last complete id went from {seen} to {current}");
        seen = current;
        late.is_up_to_date()
    }));

    assert_eq!(late.rm.applied_ids(), ids);
    assert!(ids.iter().all(|id| late.rm.received(RmCall::Replay(*id))));
    assert_eq!(
        late.manager.last_complete_tx_id_for(&blocks()).unwrap(),
        *ids.last().unwrap()
    );
    assert!(late.rm.post_sync_runs() >= 1);

    assert!(wait_until(SETTLE, || recorder
        .transitions()
        .contains(&(SyncState::PostSyncProcessing, SyncState::UpToDate))));
    let transitions = recorder.transitions();
    assert!(transitions.contains(&(SyncState::Undetermined, SyncState::Late)));
    assert!(transitions.contains(&(SyncState::Late, SyncState::Synchronizing)));
    assert!(transitions.contains(&(SyncState::Synchronizing, SyncState::PostSyncProcessing)));
    assert!(!transitions.contains(&(SyncState::Late, SyncState::UpToDate)));
    assert!(transitions
        .iter()
        .filter(|(_, to)| *to == SyncState::UpToDate)
        .all(|(from, _)| *from == SyncState::PostSyncProcessing));
}

#[test]
fn caught_up_node_takes_part_in_new_transactions() {
    let cluster = TestCluster::new(3);
    cluster.start(0);
    cluster.start(1);
    assert!(cluster.wait_up_to_date(&[0, 1], SETTLE));
    let mut ids = commit_many(cluster.node(1), 2);

    cluster.start(2);
    assert!(cluster.wait_online(3, SETTLE));
    assert!(cluster.wait_up_to_date(&[2], SETTLE));

    ids.extend(commit_many(cluster.node(2), 1));
    for node in &cluster.nodes {
        assert_eq!(node.rm.applied_ids(), ids);
    }
}

#[test]
fn restarted_node_recovers_missed_commits() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    let mut ids = commit_many(cluster.node(0), 1);

    cluster.node(2).manager.stop().unwrap();
    assert_eq!(cluster.node(2).state(), Some(SyncState::Undetermined));
    assert!(wait_until(SETTLE, || cluster.node(0).manager.online_peers().len() == 2));

    ids.extend(commit_many(cluster.node(0), 2));
    assert_eq!(cluster.node(2).rm.applied_ids(), ids[..1].to_vec());

    cluster.start(2);
    assert!(cluster.wait_up_to_date(&[2], SETTLE));
    assert_eq!(cluster.node(2).rm.applied_ids(), ids);
}

#[test]
fn up_to_date_range_makes_no_remote_call() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    commit_many(cluster.node(0), 2);
    cluster.network.clear_calls();

    let manager = &cluster.node(0).manager;
    let target = cluster.node(1).node.clone();
    let last = manager
        .synchronize_with_node(&blocks(), &target, TxId::new(5), TxId::new(5))
        .unwrap();
    assert_eq!(last, TxId::new(1));
    manager
        .synchronize_with_node(&blocks(), &target, TxId::new(7), TxId::new(3))
        .unwrap();

    assert_eq!(cluster.network.calls_to(&target.id, is_fetch), 0);
}

#[test]
fn replaying_a_range_twice_applies_it_once() {
    let cluster = TestCluster::new(3);
    cluster.start(0);
    cluster.start(1);
    assert!(cluster.wait_up_to_date(&[0, 1], SETTLE));
    let ids = commit_many(cluster.node(0), 2);

    cluster.start(2);
    assert!(cluster.wait_up_to_date(&[2], SETTLE));
    let late = cluster.node(2);
    assert_eq!(late.rm.applied_ids(), ids);

    // Same range again, from the other source
    late.rm.clear_calls();
    let source = cluster.node(1).node.clone();
    let last = late
        .manager
        .synchronize_with_node(&blocks(), &source, TxId::NONE, ids[1])
        .unwrap();

    assert_eq!(last, ids[1]);
    assert_eq!(late.rm.applied_ids(), ids);
    assert!(!late.rm.calls().iter().any(|call| matches!(call, RmCall::Replay(_))));
}

#[test]
fn incomplete_peer_journal_is_reported_as_a_gap() {
    let cluster = TestCluster::with_config(3, |config| {
        config.with_tx_timeout(Duration::from_millis(300))
    });
    cluster.start_and_settle();

    // Only node-c learns about transaction 0, through its watchdog
    let tx_id = TxId::new(0);
    let transaction = Transaction::from_request(
        &Request::new(blocks(), vec![1]),
        tx_id,
        cluster.node(0).id().clone(),
        cluster.nodes.iter().map(|n| n.node.clone()).collect(),
    );
    cluster
        .network
        .send(
            cluster.node(0).id(),
            cluster.node(2).id(),
            RemoteOp::Protocol(ProtocolOp::Start { transaction }),
        )
        .unwrap();
    let lagging = cluster.node(2);
    assert!(wait_until(SETTLE, || lagging
        .manager
        .last_complete_tx_id_for(&blocks())
        .is_ok_and(|last| last == tx_id)));

    let result = lagging.manager.synchronize_with_node(
        &blocks(),
        &cluster.node(0).node,
        TxId::NONE,
        tx_id,
    );
    match result {
        Err(ClusterError::JournalGap {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 0);
        }
        other => panic!("expected a journal gap, got {other:?}"),
    }
}

#[test]
fn failing_post_sync_hook_keeps_node_out_of_transactions() {
    let cluster = TestCluster::new(3);
    cluster.node(2).rm.fail_post_sync(true);
    cluster.start_all();
    assert!(cluster.wait_online(3, SETTLE));
    assert!(cluster.wait_up_to_date(&[0, 1], SETTLE));

    assert!(wait_until(SETTLE, || cluster.node(2).rm.post_sync_runs() >= 2));
    assert!(!cluster.node(2).is_up_to_date());

    // Its start is refused, so the transaction rolls back
    let manager = &cluster.node(0).manager;
    let task_id = manager.submit(blocks(), vec![1]).unwrap();
    assert!(wait_until(SETTLE, || manager
        .task(task_id)
        .is_some_and(|t| t.status.is_done())));
    assert_eq!(manager.task(task_id).unwrap().status, TaskStatus::RolledBack);

    cluster.node(2).rm.fail_post_sync(false);
    assert!(cluster.wait_up_to_date(&[2], SETTLE));
}

#[test]
fn synchronizing_before_start_is_refused() {
    let cluster = TestCluster::new(2);
    let manager = &cluster.node(0).manager;

    let result = manager.synchronize_with_node(
        &blocks(),
        &cluster.node(1).node,
        TxId::NONE,
        TxId::new(3),
    );
    assert!(matches!(result, Err(ClusterError::NotStarted)));
    assert!(matches!(
        manager.discover_res_mgr_status(&BTreeMap::new(), &[]),
        Err(ClusterError::NotStarted)
    ));
}

#[test]
fn unused_transaction_id_does_not_stall_the_cluster() {
    let cluster = TestCluster::with_config(3, |config| {
        config.with_tx_timeout(Duration::from_millis(300))
    });
    cluster.start_and_settle();

    // Taken by an initiator that never started a transaction with it
    let burned = cluster
        .node(0)
        .transport
        .counter("txmesh.tx.blocks")
        .increment_and_get()
        .unwrap();
    assert_eq!(burned, 0);

    cluster.network.isolate(cluster.node(2).id());
    assert!(wait_until(SETTLE, || cluster.node(0).manager.online_peers().len() == 2));
    let ids = commit_many(cluster.node(0), 3);
    assert_eq!(ids, vec![TxId::new(1), TxId::new(2), TxId::new(3)]);

    cluster.network.heal_all();
    assert!(cluster.wait_online(3, SETTLE));
    assert!(cluster.wait_up_to_date(&[0, 1, 2], SETTLE));
    assert_eq!(cluster.node(2).rm.applied_ids(), ids);
    for node in &cluster.nodes {
        assert!(wait_until(SETTLE, || node
            .manager
            .last_complete_tx_id_for(&blocks())
            .is_ok_and(|last| last == TxId::new(3))));
    }
}

#[test]
fn up_to_date_waits_for_a_quorum_holding_the_journal() {
    let cluster = TestCluster::new(3);
    cluster.start(0);
    cluster.start(1);
    assert!(cluster.wait_up_to_date(&[0, 1], SETTLE));
    let ids = commit_many(cluster.node(0), 2);

    let survivor = cluster.node(0);
    cluster.node(1).manager.stop().unwrap();
    assert!(wait_until(SETTLE, || !survivor.is_up_to_date()));

    let late = cluster.node(2);
    late.rm.fail_replay(true);
    cluster.start(2);
    assert!(wait_until(SETTLE, || survivor.manager.online_peers().len() == 2));

    // Quorum is online, but only node-a holds the commits
    std::thread::sleep(Duration::from_millis(600));
    assert!(!survivor.is_up_to_date());
    assert!(!late.is_up_to_date());
    assert!(late.rm.applied().is_empty());

    late.rm.fail_replay(false);
    assert!(cluster.wait_up_to_date(&[0, 2], SETTLE));
    assert_eq!(late.rm.applied_ids(), ids);
}

#[test]
fn quorum_ahead_sends_an_up_to_date_node_back() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();

    let behind = cluster.node(2);
    let recorder = Arc::new(TransitionRecorder::default());
    behind.manager.subscribe(recorder.clone()).unwrap();
    let known = BTreeMap::from([(blocks(), TxId::new(5))]);

    cluster
        .network
        .send(
            cluster.node(0).id(),
            behind.id(),
            RemoteOp::Discover {
                known: known.clone(),
            },
        )
        .unwrap();
    assert_eq!(behind.manager.peers_reflecting(&blocks(), TxId::new(5)), 1);
    assert!(behind.is_up_to_date());

    cluster
        .network
        .send(cluster.node(1).id(), behind.id(), RemoteOp::Discover { known })
        .unwrap();
    assert!(wait_until(SETTLE, || recorder
        .transitions()
        .contains(&(SyncState::UpToDate, SyncState::Undetermined))));

    // The next discovery round finds nothing to replay
    assert!(cluster.wait_up_to_date(&[2], SETTLE));
    assert!(behind.rm.applied().is_empty());
}
