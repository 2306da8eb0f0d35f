//! Integration tests for two-phase commit across a loopback cluster.

use std::time::{Duration, Instant};
use txmesh_core::{ClusterConfig, TaskRecord};
use txmesh_protocol::{
    ProtocolOp, RemoteOp, RemoteReply, Request, ResourceId, TaskId, TaskStatus, Transaction, TxId,
};
use txmesh_testkit::prelude::*;

const SETTLE: Duration = Duration::from_secs(5);

fn blocks() -> ResourceId {
    ResourceId::from(TEST_RESOURCE)
}

/// Waits for a task to reach a terminal status and returns its record.
fn wait_done(node: &TestNode, task_id: TaskId) -> TaskRecord {
    assert!(
        wait_until(SETTLE, || node
            .manager
            .task(task_id)
            .is_some_and(|t| t.status.is_done())),
        "task {task_id} did not finish"
    );
    node.manager.task(task_id).unwrap()
}

#[test]
fn commit_reaches_every_participant() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    for node in &cluster.nodes {
        node.rm.clear_calls();
    }

    let initiator = cluster.node(0);
    let task_id = initiator.manager.submit(blocks(), vec![1, 2, 3]).unwrap();
    let task = wait_done(initiator, task_id);

    assert_eq!(task.status, TaskStatus::Committed);
    assert_eq!(
        task.history,
        vec![
            TaskStatus::Pending,
            TaskStatus::Started,
            TaskStatus::Prepared,
            TaskStatus::Committed
        ]
    );
    let tx_id = task.tx_id.unwrap();
    assert_eq!(tx_id, TxId::new(0));

    for node in &cluster.nodes {
        assert_eq!(
            node.rm.calls(),
            vec![RmCall::Start(tx_id), RmCall::Prepare(tx_id), RmCall::Commit(tx_id)]
        );
        assert_eq!(node.rm.applied(), vec![(tx_id, vec![1, 2, 3])]);
        assert_eq!(node.manager.last_complete_tx_id_for(&blocks()).unwrap(), tx_id);
        assert_eq!(node.manager.res_mgr(&blocks()).unwrap().inflight, 0);
    }

    // Too late to cancel
    assert!(!initiator.manager.cancel(task_id));
    assert_eq!(initiator.manager.pending_count(), 0);
}

#[test]
fn failed_vote_rolls_back_everywhere() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    cluster.node(2).rm.fail_prepare(true);

    let initiator = cluster.node(0);
    let task_id = initiator.manager.submit(blocks(), vec![9]).unwrap();
    let task = wait_done(initiator, task_id);

    assert_eq!(task.status, TaskStatus::RolledBack);
    assert!(task.message.is_some());
    let tx_id = task.tx_id.unwrap();

    for node in &cluster.nodes {
        assert!(node.rm.received(RmCall::Rollback(tx_id)));
        assert!(!node.rm.received(RmCall::Commit(tx_id)));
        assert!(node.rm.applied().is_empty());
        // The rollback marker still moves the journal forward
        assert_eq!(node.manager.last_complete_tx_id_for(&blocks()).unwrap(), tx_id);
    }
}

#[test]
fn failed_start_skips_prepare() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    cluster.node(1).rm.fail_start(true);

    let initiator = cluster.node(0);
    let task_id = initiator.manager.submit(blocks(), vec![4]).unwrap();
    let task = wait_done(initiator, task_id);

    assert_eq!(task.status, TaskStatus::RolledBack);
    let tx_id = task.tx_id.unwrap();
    for node in &cluster.nodes {
        assert!(!node.rm.received(RmCall::Prepare(tx_id)));
        assert!(node.rm.received(RmCall::Rollback(tx_id)));
    }
}

#[test]
fn unknown_resource_is_rolled_back() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();

    let initiator = cluster.node(0);
    let task_id = initiator
        .manager
        .submit(ResourceId::from("missing"), vec![1])
        .unwrap();
    let task = wait_done(initiator, task_id);

    assert_eq!(task.status, TaskStatus::RolledBack);
    assert!(task.tx_id.is_none());
    assert!(task.message.unwrap().contains("missing"));
}

#[test]
fn queued_task_can_be_cancelled() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    for node in &cluster.nodes {
        node.rm.delay_prepare(Some(Duration::from_millis(300)));
    }

    let manager = &cluster.node(0).manager;
    let slow = manager.submit(blocks(), vec![1]).unwrap();
    assert!(wait_until(SETTLE, || manager
        .task(slow)
        .is_some_and(|t| t.status == TaskStatus::Started)));

    let queued = manager.submit(blocks(), vec![2]).unwrap();
    assert_eq!(manager.pending_count(), 1);
    assert_eq!(manager.peek_pending().unwrap().task_id, queued);

    assert!(manager.cancel(queued));
    assert_eq!(manager.pending_count(), 0);
    let record = manager.task(queued).unwrap();
    assert_eq!(record.status, TaskStatus::RolledBack);
    assert!(record.tx_id.is_none());

    assert_eq!(wait_done(cluster.node(0), slow).status, TaskStatus::Committed);
    assert!(!manager.cancel(queued));
}

#[test]
fn transaction_ids_increase_across_initiators() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();

    let mut ids = Vec::new();
    for round in 0..6u8 {
        let node = cluster.node(usize::from(round) % 3);
        let task_id = node.manager.submit(blocks(), vec![round]).unwrap();
        let task = wait_done(node, task_id);
        assert_eq!(task.status, TaskStatus::Committed);
        ids.push(task.tx_id.unwrap());
    }

    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    for node in &cluster.nodes {
        assert_eq!(node.rm.applied_ids(), ids);
        assert_eq!(node.manager.last_complete_tx_id(), *ids.last().unwrap());
    }
}

#[test]
fn last_complete_tx_id_never_decreases() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();

    let manager = &cluster.node(1).manager;
    let mut seen = manager.last_complete_tx_id();
    assert!(seen.is_none());

    for payload in 0..4u8 {
        let task_id = cluster.node(0).manager.submit(blocks(), vec![payload]).unwrap();
        wait_done(cluster.node(0), task_id);

        let current = manager.last_complete_tx_id();
        assert!(current >= seen);
        seen = current;
    }
    assert_eq!(seen, TxId::new(3));
}

#[test]
fn tasks_are_indexed_per_resource() {
    let cluster = TestCluster::new(1);
    cluster.start_and_settle();

    let manager = &cluster.node(0).manager;
    let first = manager.submit(blocks(), vec![1]).unwrap();
    let second = manager.submit(blocks(), vec![2]).unwrap();
    wait_done(cluster.node(0), first);
    wait_done(cluster.node(0), second);

    let tasks = manager.tasks_for(&blocks());
    assert_eq!(tasks.len(), 2);
    assert!(manager.tasks_for(&ResourceId::from("other")).is_empty());
    assert!(manager.task(TaskId::generate()).is_none());
}

#[test]
fn stalled_transaction_is_rolled_back_by_the_watchdog() {
    let cluster = TestCluster::with_config(3, |config: ClusterConfig| {
        config.with_tx_timeout(Duration::from_millis(1000))
    });
    cluster.start_and_settle();

    // Start a transaction on node-b and never finish it
    let initiator = cluster.node(0);
    let participant = cluster.node(1);
    let request = Request::new(blocks(), vec![7]);
    let tx_id = TxId::new(0);
    let transaction = Transaction::from_request(
        &request,
        tx_id,
        initiator.id().clone(),
        cluster.nodes.iter().map(|n| n.node.clone()).collect(),
    );
    let started = Instant::now();
    let reply = cluster
        .network
        .send(
            initiator.id(),
            participant.id(),
            RemoteOp::Protocol(ProtocolOp::Start { transaction }),
        )
        .unwrap();
    assert!(matches!(reply, RemoteReply::Outcome(ref r) if r.is_success()));
    assert!(participant.rm.received(RmCall::Start(tx_id)));

    assert!(wait_until(Duration::from_secs(3), || participant
        .rm
        .received(RmCall::Rollback(tx_id))));
    assert!(started.elapsed() >= Duration::from_millis(900));

    assert!(cluster.network.counter_value("txmesh.tx.blocks") >= tx_id.as_i64());
    assert_eq!(
        participant.manager.last_complete_tx_id_for(&blocks()).unwrap(),
        tx_id
    );
    assert_eq!(participant.manager.res_mgr(&blocks()).unwrap().inflight, 0);
    assert!(!initiator.rm.received(RmCall::Rollback(tx_id)));
}

#[test]
fn commit_for_unknown_transaction_is_refused() {
    let cluster = TestCluster::new(2);
    cluster.start_and_settle();

    let reply = cluster
        .network
        .send(
            cluster.node(0).id(),
            cluster.node(1).id(),
            RemoteOp::Protocol(ProtocolOp::Commit {
                resource: blocks(),
                tx_id: TxId::new(42),
            }),
        )
        .unwrap();

    match reply {
        RemoteReply::Outcome(result) => assert!(!result.is_success()),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(!cluster.node(1).rm.received(RmCall::Commit(TxId::new(42))));
    assert!(cluster.node(1).rm.applied().is_empty());
}

#[test]
fn vote_arriving_after_the_watchdog_does_not_commit() {
    let cluster = TestCluster::with_config(3, |config: ClusterConfig| {
        config.with_tx_timeout(Duration::from_millis(300))
    });
    cluster.start_and_settle();
    cluster
        .node(2)
        .rm
        .delay_prepare(Some(Duration::from_millis(450)));

    let initiator = cluster.node(0);
    let task_id = initiator.manager.submit(blocks(), vec![5]).unwrap();
    let task = wait_done(initiator, task_id);

    assert_eq!(task.status, TaskStatus::RolledBack);
    let tx_id = task.tx_id.unwrap();
    for node in &cluster.nodes {
        assert!(!node.rm.received(RmCall::Commit(tx_id)));
        assert!(node.rm.applied().is_empty());
        assert!(wait_until(SETTLE, || node
            .manager
            .last_complete_tx_id_for(&blocks())
            .is_ok_and(|last| last == tx_id)));
    }
}

#[test]
fn commit_after_local_rollback_is_refused() {
    let cluster = TestCluster::new(2);
    cluster.start_and_settle();

    let initiator = cluster.node(0);
    let participant = cluster.node(1);
    let request = Request::new(blocks(), vec![3]);
    let tx_id = TxId::new(0);
    let transaction = Transaction::from_request(
        &request,
        tx_id,
        initiator.id().clone(),
        cluster.nodes.iter().map(|n| n.node.clone()).collect(),
    );
    let steps = [
        ProtocolOp::Start { transaction },
        ProtocolOp::Rollback {
            resource: blocks(),
            tx_id,
        },
    ];
    for op in steps {
        let reply = cluster
            .network
            .send(initiator.id(), participant.id(), RemoteOp::Protocol(op))
            .unwrap();
        assert!(matches!(reply, RemoteReply::Outcome(ref r) if r.is_success()));
    }

    let reply = cluster
        .network
        .send(
            initiator.id(),
            participant.id(),
            RemoteOp::Protocol(ProtocolOp::Commit {
                resource: blocks(),
                tx_id,
            }),
        )
        .unwrap();
    match reply {
        RemoteReply::Outcome(result) => assert!(!result.is_success()),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(!participant.rm.received(RmCall::Commit(tx_id)));
    assert!(participant.rm.applied().is_empty());
}
