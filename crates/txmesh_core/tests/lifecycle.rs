//! Integration tests for the manager lifecycle, journaling and reentrancy.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tempfile::{tempdir, NamedTempFile};
use txmesh_core::{
    ClusterConfig, ClusterError, ClusterEvent, ClusterListener, ClusterResult, ClusterStatus,
    ListenerResult, Manager, ResourceManager, TaskRetention, TxContext,
};
use txmesh_protocol::{
    JournalEntry, Node, OpResult, ResourceId, TaskId, TaskStatus, Transaction,
};
use txmesh_testkit::prelude::*;

const SETTLE: Duration = Duration::from_secs(5);

fn blocks() -> ResourceId {
    ResourceId::from(TEST_RESOURCE)
}

fn single_node_config() -> ClusterConfig {
    let node = test_node(0);
    test_config("test-cluster", node.clone(), &[node])
}

fn wait_status(manager: &Manager, task_id: TaskId, status: TaskStatus) -> bool {
    wait_until(SETTLE, || {
        manager.task(task_id).is_some_and(|t| t.status == status)
    })
}

/// Records node status transitions.
#[derive(Default)]
struct StatusRecorder {
    seen: Mutex<Vec<(ClusterStatus, ClusterStatus)>>,
}

impl ClusterListener for StatusRecorder {
    fn on_event(&self, event: &ClusterEvent) -> ListenerResult {
        if let ClusterEvent::NodeStatusChanged { from, to } = event {
            self.seen.lock().push((*from, *to));
        }
        Ok(())
    }
}

#[test]
fn lifecycle_walks_through_every_status() {
    let network = LoopbackNetwork::new();
    let manager = Manager::new(single_node_config(), network.transport(test_node(0)));
    assert_eq!(manager.status(), ClusterStatus::NotInitialized);

    manager.init().unwrap();
    let recorder = Arc::new(StatusRecorder::default());
    manager.subscribe(recorder.clone()).unwrap();
    assert_eq!(manager.status(), ClusterStatus::Initialized);

    manager.start().unwrap();
    assert_eq!(manager.status(), ClusterStatus::Started);
    assert!(network.is_connected(&test_node(0).id));

    manager.restart().unwrap();
    assert_eq!(manager.status(), ClusterStatus::Started);

    manager.stop().unwrap();
    assert_eq!(manager.status(), ClusterStatus::Initialized);
    assert!(!network.is_connected(&test_node(0).id));

    let expected = vec![
        (ClusterStatus::Initialized, ClusterStatus::Started),
        (ClusterStatus::Started, ClusterStatus::Initialized),
        (ClusterStatus::Initialized, ClusterStatus::Started),
        (ClusterStatus::Started, ClusterStatus::Initialized),
    ];
    assert!(wait_until(SETTLE, || *recorder.seen.lock() == expected));

    manager.fini().unwrap();
    assert_eq!(manager.status(), ClusterStatus::NotInitialized);
}

#[test]
fn operations_in_the_wrong_status_are_rejected() {
    let network = LoopbackNetwork::new();
    let manager = Manager::new(single_node_config(), network.transport(test_node(0)));

    assert!(matches!(manager.start(), Err(ClusterError::InvalidStatus { .. })));
    assert!(matches!(manager.stop(), Err(ClusterError::InvalidStatus { .. })));
    assert!(matches!(manager.fini(), Err(ClusterError::InvalidStatus { .. })));
    let rm = Arc::new(ScriptedResourceManager::new(TEST_RESOURCE));
    assert!(matches!(
        manager.register_resource_manager(rm),
        Err(ClusterError::InvalidStatus { .. })
    ));

    manager.init().unwrap();
    assert!(matches!(manager.init(), Err(ClusterError::InvalidStatus { .. })));
    assert!(matches!(manager.stop(), Err(ClusterError::InvalidStatus { .. })));
    assert!(matches!(
        manager.submit(blocks(), vec![1]),
        Err(ClusterError::NotStarted)
    ));

    manager.start().unwrap();
    assert!(matches!(manager.start(), Err(ClusterError::InvalidStatus { .. })));
}

#[test]
fn invalid_configuration_fails_init() {
    let network = LoopbackNetwork::new();

    let config = single_node_config().with_tx_timeout(Duration::ZERO);
    let manager = Manager::new(config, network.transport(test_node(0)));
    assert!(matches!(manager.init(), Err(ClusterError::Config(_))));
    assert_eq!(manager.status(), ClusterStatus::NotInitialized);

    // Transport and configuration disagree on the local node
    let manager = Manager::new(single_node_config(), network.transport(test_node(1)));
    assert!(matches!(manager.init(), Err(ClusterError::Config(_))));

    // Journal directory path is a regular file
    let file = NamedTempFile::new().unwrap();
    let config = single_node_config().with_journal_dir(file.path());
    let manager = Manager::new(config, network.transport(test_node(0)));
    assert!(matches!(manager.init(), Err(ClusterError::Config(_))));
}

#[test]
fn failed_connect_leaves_node_failed_until_stopped() {
    let cluster = TestCluster::new(1);
    cluster.start(0);

    // A second manager claiming the same identity
    let twin = Manager::new(single_node_config(), cluster.network.transport(test_node(0)));
    twin.init().unwrap();
    assert!(matches!(twin.start(), Err(ClusterError::Transport { .. })));
    assert_eq!(twin.status(), ClusterStatus::Failed);
    assert!(matches!(twin.submit(blocks(), vec![1]), Err(ClusterError::NotStarted)));

    twin.stop().unwrap();
    assert_eq!(twin.status(), ClusterStatus::Initialized);
    // The original node is untouched
    assert!(cluster.network.is_connected(cluster.node(0).id()));
}

#[test]
fn duplicate_resource_manager_is_rejected() {
    let cluster = TestCluster::new(1);
    let manager = &cluster.node(0).manager;

    let again = Arc::new(ScriptedResourceManager::new(TEST_RESOURCE));
    assert!(matches!(
        manager.register_resource_manager(again),
        Err(ClusterError::AlreadyRegistered(_))
    ));

    manager.unregister_resource_manager(&blocks()).unwrap();
    assert!(manager.res_mgr(&blocks()).is_none());
    assert!(matches!(
        manager.unregister_resource_manager(&blocks()),
        Err(ClusterError::UnknownResource(_))
    ));
}

#[test]
fn single_node_cluster_commits_alone() {
    let cluster = TestCluster::new(1);
    cluster.start_and_settle();
    let node = cluster.node(0);

    let info = node.manager.node_info();
    assert_eq!(info.id, node.node.id);
    assert_eq!(info.port, 7000);

    let task_id = node.manager.submit(blocks(), b"solo".to_vec()).unwrap();
    assert!(wait_status(&node.manager, task_id, TaskStatus::Committed));
    assert_eq!(node.rm.applied_ids().len(), 1);
}

#[test]
fn stop_drops_queued_requests_as_unknown() {
    let cluster = TestCluster::new(3);
    cluster.start_and_settle();
    for node in &cluster.nodes {
        node.rm.delay_prepare(Some(Duration::from_millis(300)));
    }

    let manager = &cluster.node(0).manager;
    let running = manager.submit(blocks(), vec![1]).unwrap();
    assert!(wait_status(manager, running, TaskStatus::Started));
    let queued = manager.submit(blocks(), vec![2]).unwrap();
    assert_eq!(manager.pending_count(), 1);

    manager.stop().unwrap();

    let record = manager.task(queued).unwrap();
    assert_eq!(record.status, TaskStatus::Unknown);
    assert!(record.tx_id.is_none());
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(cluster.node(0).state(), Some(txmesh_core::SyncState::Undetermined));
}

#[test]
fn journals_survive_a_restart() {
    let dir = tempdir().unwrap();
    let network = LoopbackNetwork::new();
    let config = || single_node_config().with_journal_dir(dir.path());

    let task_id = {
        let manager = Manager::new(config(), network.transport(test_node(0)));
        manager.init().unwrap();
        let rm = Arc::new(ScriptedResourceManager::new(TEST_RESOURCE));
        manager.register_resource_manager(rm).unwrap();
        manager.start().unwrap();
        assert!(wait_until(SETTLE, || manager
            .res_mgr(&blocks())
            .is_some_and(|info| info.state == txmesh_core::SyncState::UpToDate)));

        let first = manager.submit(blocks(), vec![1]).unwrap();
        assert!(wait_status(&manager, first, TaskStatus::Committed));
        let second = manager.submit(blocks(), vec![2]).unwrap();
        assert!(wait_status(&manager, second, TaskStatus::Committed));

        let info = manager.res_mgr(&blocks()).unwrap();
        assert!(info.journal_running);
        assert!(info.journal_path.is_some());
        manager.fini().unwrap();
        second
    };

    let manager = Manager::new(config(), network.transport(test_node(0)));
    manager.init().unwrap();
    let rm = Arc::new(ScriptedResourceManager::new(TEST_RESOURCE));
    manager.register_resource_manager(rm.clone()).unwrap();

    assert_eq!(manager.last_complete_tx_id_for(&blocks()).unwrap().as_i64(), 1);
    assert_eq!(manager.last_complete_tx_id().as_i64(), 1);
    assert!(manager.tasks().is_empty());

    // Found through the journal
    let record = manager.task(task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Committed);
    assert_eq!(record.tx_id.unwrap().as_i64(), 1);

    // Restarted, the next transaction continues the sequence
    manager.start().unwrap();
    assert!(wait_until(SETTLE, || manager
        .res_mgr(&blocks())
        .is_some_and(|info| info.state == txmesh_core::SyncState::UpToDate)));
    let next = manager.submit(blocks(), vec![3]).unwrap();
    assert!(wait_status(&manager, next, TaskStatus::Committed));
    assert_eq!(manager.task(next).unwrap().tx_id.unwrap().as_i64(), 2);
    assert!(rm.applied().iter().all(|(id, _)| id.as_i64() == 2));
}

#[test]
fn purged_tasks_are_still_found_in_the_journal() {
    let retention = TaskRetention::new(100, Duration::from_millis(20))
        .with_schedule(Duration::from_millis(20), Duration::ZERO);
    let cluster = TestCluster::with_config(1, |config| config.with_retention(retention.clone()));
    cluster.start_and_settle();
    let manager = &cluster.node(0).manager;

    let task_id = manager.submit(blocks(), vec![5]).unwrap();
    assert!(wait_status(manager, task_id, TaskStatus::Committed));
    assert!(wait_until(SETTLE, || manager.tasks().is_empty()));

    let record = manager.task(task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Committed);
    assert_eq!(record.history, vec![TaskStatus::Committed]);
}

/// Calls back into its manager from inside `commit`.
struct CallbackResourceManager {
    manager: OnceLock<Weak<Manager>>,
    results: Mutex<Vec<ClusterResult<()>>>,
    seen_res_mgrs: Mutex<Option<usize>>,
}

impl CallbackResourceManager {
    fn new() -> Self {
        Self {
            manager: OnceLock::new(),
            results: Mutex::new(Vec::new()),
            seen_res_mgrs: Mutex::new(None),
        }
    }
}

impl ResourceManager for CallbackResourceManager {
    fn id(&self) -> ResourceId {
        blocks()
    }

    fn start(&self, _ctx: &TxContext, _transaction: &Transaction) -> OpResult {
        OpResult::ok()
    }

    fn prepare(&self, _ctx: &TxContext) -> OpResult {
        OpResult::ok()
    }

    fn commit(&self, ctx: &TxContext) -> OpResult {
        if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
            let view = manager.reentrant(ctx);
            let mut results = self.results.lock();
            results.push(view.stop());
            results.push(manager.stop());
            *self.seen_res_mgrs.lock() = Some(view.res_mgrs().len());
        }
        OpResult::ok()
    }

    fn rollback(&self, _ctx: &TxContext) -> OpResult {
        OpResult::ok()
    }

    fn replay(&self, _entry: &JournalEntry) -> OpResult {
        OpResult::ok()
    }
}

fn callback_node(
    network: &LoopbackNetwork,
    index: usize,
    all: &[Node],
) -> (Arc<Manager>, Arc<CallbackResourceManager>) {
    let node = test_node(index);
    let manager = Arc::new(Manager::new(
        test_config("test-cluster", node.clone(), all),
        network.transport(node),
    ));
    manager.init().unwrap();
    let rm = Arc::new(CallbackResourceManager::new());
    assert!(rm.manager.set(Arc::downgrade(&manager)).is_ok());
    manager.register_resource_manager(rm.clone()).unwrap();
    (manager, rm)
}

fn wait_ready(manager: &Manager) -> bool {
    wait_until(SETTLE, || {
        manager
            .res_mgr(&blocks())
            .is_some_and(|info| info.state == txmesh_core::SyncState::UpToDate)
    })
}

fn assert_refused(rm: &CallbackResourceManager) {
    let results = rm.results.lock();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(ClusterError::StopWithinTransaction))));
    assert_eq!(*rm.seen_res_mgrs.lock(), Some(1));
}

#[test]
fn stop_from_inside_a_transaction_is_refused() {
    let network = LoopbackNetwork::new();
    let (manager, rm) = callback_node(&network, 0, &[test_node(0)]);
    manager.start().unwrap();
    assert!(wait_ready(&manager));

    let task_id = manager.submit(blocks(), vec![1]).unwrap();
    assert!(wait_status(&manager, task_id, TaskStatus::Committed));

    assert_refused(&rm);
    assert_eq!(manager.status(), ClusterStatus::Started);
}

#[test]
fn stop_from_a_participant_callback_is_refused() {
    let network = LoopbackNetwork::new();
    let all = [test_node(0), test_node(1)];
    let (initiator, initiator_rm) = callback_node(&network, 0, &all);
    let (participant, participant_rm) = callback_node(&network, 1, &all);
    initiator.start().unwrap();
    participant.start().unwrap();
    assert!(wait_ready(&initiator));
    assert!(wait_ready(&participant));

    let task_id = initiator.submit(blocks(), vec![2]).unwrap();
    assert!(wait_status(&initiator, task_id, TaskStatus::Committed));

    // The participant commits on a thread other than its coordinator
    assert_refused(&participant_rm);
    assert_refused(&initiator_rm);
    assert_eq!(participant.status(), ClusterStatus::Started);
    assert_eq!(initiator.status(), ClusterStatus::Started);

    // Outside a callback, stop goes through
    participant.stop().unwrap();
    assert_eq!(participant.status(), ClusterStatus::Initialized);
}
