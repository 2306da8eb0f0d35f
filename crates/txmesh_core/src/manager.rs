//! Coordinator facade.
//!
//! [`Manager`] owns the shared cluster state and the background threads,
//! and serializes lifecycle changes with one read/write lock:
//!
//! ```text
//! NOT_INITIALIZED ──init──▶ INITIALIZED ──start──▶ STARTED
//!        ▲                   │    ▲                 │   │
//!        └───────fini────────┘    └──────stop───────┘   │ connect failed
//!                                 ▲                     ▼
//!                                 └───────stop────── FAILED
//! ```

use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::context::TxContext;
use crate::coordinator::Coordinator;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, ClusterListener, DeadLetter, SubscriptionId};
use crate::handler::NodeDispatcher;
use crate::membership::MembershipTracker;
use crate::resmgr::{ResMgrEntry, ResourceManager};
use crate::status::{ClusterStatus, SyncState};
use crate::sync::{DiscoveryOutcome, SyncListener, Synchronizer};
use crate::tasks::{TaskPurger, TaskRecord};
use crate::transport::{ClusterTransport, MembershipListener};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use txmesh_journal::{Journal, JournalDir};
use txmesh_protocol::{Node, NodeId, Request, ResourceId, TaskId, TxId};

/// Identity of the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node id.
    pub id: NodeId,
    /// Listen address.
    pub address: IpAddr,
    /// Listen port.
    pub port: u16,
}

/// Read-only view of one registered resource manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResMgrInfo {
    /// Resource manager id.
    pub id: ResourceId,
    /// Synchronization state.
    pub state: SyncState,
    /// Last completed transaction id.
    pub last_tx_id: TxId,
    /// Journal file, if the journal is file backed.
    pub journal_path: Option<PathBuf>,
    /// Whether the journal accepts appends.
    pub journal_running: bool,
    /// Transactions started here and not yet completed.
    pub inflight: usize,
}

impl ResMgrInfo {
    fn of(entry: &ResMgrEntry) -> Self {
        Self {
            id: entry.id.clone(),
            state: entry.state(),
            last_tx_id: entry.last_tx_id(),
            journal_path: entry.journal.path().map(PathBuf::from),
            journal_running: entry.journal.is_running(),
            inflight: entry.inflight_count(),
        }
    }
}

#[derive(Default)]
struct Runtime {
    journal_dir: Option<JournalDir>,
    synchronizer: Option<Synchronizer>,
    purger: Option<TaskPurger>,
    sync_listener: Option<SubscriptionId>,
}

/// The distributed transaction coordinator of one node.
///
/// # Example
///
/// ```ignore
/// let manager = Manager::new(config, transport);
/// manager.init()?;
/// manager.register_resource_manager(Arc::new(MyStore::new()))?;
/// manager.start()?;
/// let task = manager.submit(ResourceId::from("blocks"), payload)?;
/// ```
pub struct Manager {
    cluster: Arc<Cluster>,
    coordinator: Coordinator,
    status: RwLock<ClusterStatus>,
    runtime: Mutex<Runtime>,
}

impl Manager {
    /// Creates a manager in `NOT_INITIALIZED`.
    pub fn new(config: ClusterConfig, transport: Arc<dyn ClusterTransport>) -> Self {
        let cluster = Cluster::new(config, transport);
        let coordinator = Coordinator::new(Arc::clone(&cluster));
        Self {
            cluster,
            coordinator,
            status: RwLock::new(ClusterStatus::NotInitialized),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    fn set_status(&self, current: &mut ClusterStatus, to: ClusterStatus) {
        let from = *current;
        *current = to;
        info!(node = %self.cluster.local().id, %from, %to, "node status changed");
        self.cluster
            .events
            .publish(ClusterEvent::NodeStatusChanged { from, to });
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Validates the configuration, opens the journal directory and
    /// registers the configured peers.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] for invalid configuration or an
    /// unusable journal directory.
    pub fn init(&self) -> ClusterResult<()> {
        let mut status = self.status.write();
        if *status != ClusterStatus::NotInitialized {
            return Err(ClusterError::invalid_status("init", *status));
        }

        let config = &self.cluster.config;
        config.validate()?;
        let transport_local = self.cluster.transport.local_node();
        if transport_local.id != config.local.id {
            return Err(ClusterError::config(format!(
                "transport runs as {}, configuration names {}",
                transport_local.id, config.local.id
            )));
        }

        let journal_dir = match &config.journal_dir {
            Some(path) => Some(JournalDir::open(path, true).map_err(|e| {
                ClusterError::config(format!("journal directory {}: {e}", path.display()))
            })?),
            None => None,
        };

        for peer in &config.peers {
            if peer.id == config.local.id {
                continue;
            }
            match self.cluster.nodes.register_peer(peer.clone(), false) {
                Ok(()) | Err(ClusterError::AlreadyRegistered(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let listener = self
            .cluster
            .events
            .subscribe(Arc::new(SyncListener::new(self.cluster.weak())))?;

        let mut runtime = self.runtime.lock();
        runtime.journal_dir = journal_dir;
        runtime.sync_listener = Some(listener);
        drop(runtime);

        self.set_status(&mut status, ClusterStatus::Initialized);
        Ok(())
    }

    /// Joins the cluster and starts the background threads.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Transport`] if the transport cannot connect;
    /// the node is then `FAILED` and must be stopped before retrying.
    pub fn start(&self) -> ClusterResult<()> {
        let mut status = self.status.write();
        if *status != ClusterStatus::Initialized {
            return Err(ClusterError::invalid_status("start", *status));
        }

        match self.start_runtime() {
            Ok(()) => {
                self.set_status(&mut status, ClusterStatus::Started);
                Ok(())
            }
            Err(e) => {
                warn!(node = %self.cluster.local().id, error = %e, "start failed");
                self.cluster.set_serving(false);
                self.set_status(&mut status, ClusterStatus::Failed);
                Err(e)
            }
        }
    }

    fn start_runtime(&self) -> ClusterResult<()> {
        let cluster = &self.cluster;
        cluster.set_serving(true);

        let membership = Arc::new(MembershipTracker::new(cluster.weak()));
        cluster.transport.connect(
            &cluster.config.cluster_name,
            cluster.config.secret.as_deref(),
            Arc::new(NodeDispatcher::new(cluster.weak())),
            Arc::clone(&membership) as Arc<dyn MembershipListener>,
        )?;
        cluster.nodes.mark_local_online();
        for member in cluster.transport.members() {
            membership.member_joined(member);
        }

        self.coordinator.start()?;
        let mut runtime = self.runtime.lock();
        runtime.synchronizer = Some(Synchronizer::start(Arc::clone(cluster))?);
        runtime.purger = Some(TaskPurger::start(Arc::clone(&cluster.tasks))?);
        Ok(())
    }

    /// Leaves the cluster and stops the background threads.
    ///
    /// Queued requests are dropped and marked `UNKNOWN`; transactions in
    /// flight here are discarded and recovered by synchronization after
    /// the next start.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::StopWithinTransaction`] when called from a
    ///   resource manager callback
    /// - [`ClusterError::InvalidStatus`] unless `STARTED` or `FAILED`
    pub fn stop(&self) -> ClusterResult<()> {
        self.refuse_within_transaction()?;
        let mut status = self.status.write();
        if !matches!(*status, ClusterStatus::Started | ClusterStatus::Failed) {
            return Err(ClusterError::invalid_status("stop", *status));
        }
        self.stop_runtime();
        self.set_status(&mut status, ClusterStatus::Initialized);
        Ok(())
    }

    fn refuse_within_transaction(&self) -> ClusterResult<()> {
        match self.cluster.steps.current() {
            Some(ctx) => {
                warn!(resource = %ctx.resource(), tx_id = %ctx.tx_id(), "stop requested from inside a transaction");
                Err(ClusterError::StopWithinTransaction)
            }
            None => Ok(()),
        }
    }

    fn stop_runtime(&self) {
        let cluster = &self.cluster;
        cluster.set_serving(false);
        self.coordinator.stop();

        let (synchronizer, purger) = {
            let mut runtime = self.runtime.lock();
            (runtime.synchronizer.take(), runtime.purger.take())
        };
        if let Some(synchronizer) = synchronizer {
            synchronizer.stop();
        }
        if let Some(purger) = purger {
            purger.stop();
        }

        let abandoned = cluster.abandon_inflight();
        if abandoned > 0 {
            info!(abandoned, "in-flight transactions discarded");
        }
        cluster.transport.disconnect();
        cluster.nodes.clear_online();
        cluster.resmgrs.clear_cluster_updates();
        cluster.orphans.lock().clear();
        for entry in cluster.resmgrs.entries() {
            cluster.resmgrs.mark_undetermined(&entry, "node stopped");
        }
    }

    /// Stops if needed, unregisters every resource manager, releases the
    /// journal directory and drops every event subscriber.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::StopWithinTransaction`] when called from a
    ///   resource manager callback
    /// - [`ClusterError::InvalidStatus`] when not initialized
    pub fn fini(&self) -> ClusterResult<()> {
        self.refuse_within_transaction()?;
        let mut status = self.status.write();
        match *status {
            ClusterStatus::NotInitialized => {
                return Err(ClusterError::invalid_status("fini", *status));
            }
            ClusterStatus::Started | ClusterStatus::Failed => {
                self.stop_runtime();
                self.set_status(&mut status, ClusterStatus::Initialized);
            }
            ClusterStatus::Initialized => {}
        }

        for entry in self.cluster.resmgrs.entries() {
            self.release(&entry.id);
        }

        let mut runtime = self.runtime.lock();
        if let Some(listener) = runtime.sync_listener.take() {
            self.cluster.events.unsubscribe(listener);
        }
        runtime.journal_dir = None;
        drop(runtime);

        self.set_status(&mut status, ClusterStatus::NotInitialized);
        self.cluster.events.shutdown();
        Ok(())
    }

    /// `stop` followed by `start`.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub fn restart(&self) -> ClusterResult<()> {
        self.stop()?;
        self.start()
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ClusterStatus {
        *self.status.read()
    }

    // =========================================================================
    // Resource managers
    // =========================================================================

    /// Registers a resource manager. It starts `UNDETERMINED` and takes
    /// part in transactions once synchronized.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::InvalidStatus`] unless initialized or started
    /// - [`ClusterError::AlreadyRegistered`] for a duplicate id
    /// - [`ClusterError::Journal`] if its journal cannot be opened
    pub fn register_resource_manager(&self, rm: Arc<dyn ResourceManager>) -> ClusterResult<()> {
        let status = self.status.read();
        if !matches!(*status, ClusterStatus::Initialized | ClusterStatus::Started) {
            return Err(ClusterError::invalid_status(
                "register a resource manager",
                *status,
            ));
        }

        let id = rm.id();
        if self.cluster.resmgrs.get(&id).is_some() {
            return Err(ClusterError::AlreadyRegistered(id.to_string()));
        }
        let journal = match &self.runtime.lock().journal_dir {
            Some(dir) => Journal::open_file(&dir.journal_path(id.as_str()))?,
            None => Journal::in_memory(),
        };

        let entry = self.cluster.resmgrs.register(rm, Arc::new(journal))?;
        let last = entry.last_tx_id();
        if !last.is_none() {
            self.cluster.observe_completed(last);
            if *status == ClusterStatus::Started {
                if let Err(e) = self.cluster.tx_counter(&id).fetch_max(last.as_i64()) {
                    debug!(resource = %id, error = %e, "could not merge transaction counter");
                }
            }
        }
        self.cluster.sync_trigger.trigger();
        Ok(())
    }

    /// Unregisters a resource manager and closes its journal.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownResource`] if it is not registered.
    pub fn unregister_resource_manager(&self, id: &ResourceId) -> ClusterResult<()> {
        let _status = self.status.read();
        if self.cluster.resmgrs.get(id).is_none() {
            return Err(ClusterError::UnknownResource(id.clone()));
        }
        self.release(id);
        Ok(())
    }

    fn release(&self, id: &ResourceId) {
        match self.cluster.resmgrs.unregister(id) {
            Ok(entry) => {
                if let Err(e) = entry.journal.close() {
                    warn!(resource = %id, error = %e, "journal close failed");
                }
            }
            Err(e) => debug!(resource = %id, error = %e, "resource manager already gone"),
        }
    }

    /// Every registered resource manager.
    pub fn res_mgrs(&self) -> Vec<ResMgrInfo> {
        let _status = self.status.read();
        self.res_mgrs_unlocked()
    }

    fn res_mgrs_unlocked(&self) -> Vec<ResMgrInfo> {
        self.cluster
            .resmgrs
            .entries()
            .iter()
            .map(|entry| ResMgrInfo::of(entry))
            .collect()
    }

    /// One registered resource manager.
    pub fn res_mgr(&self, id: &ResourceId) -> Option<ResMgrInfo> {
        let _status = self.status.read();
        self.res_mgr_unlocked(id)
    }

    fn res_mgr_unlocked(&self, id: &ResourceId) -> Option<ResMgrInfo> {
        self.cluster
            .resmgrs
            .get(id)
            .map(|entry| ResMgrInfo::of(&entry))
    }

    // =========================================================================
    // Peers
    // =========================================================================

    /// Registers a peer.
    ///
    /// While started, the registration is refused unless quorum is online
    /// for the current peer set.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::AlreadyRegistered`] for a known id
    /// - [`ClusterError::PeerRejected`] without quorum
    pub fn register_peer(&self, node: Node) -> ClusterResult<()> {
        let status = self.status.write();
        let started = *status == ClusterStatus::Started;
        self.cluster.nodes.register_peer(node.clone(), started)?;

        if started
            && self
                .cluster
                .transport
                .members()
                .iter()
                .any(|member| member.id == node.id)
        {
            MembershipTracker::new(self.cluster.weak()).member_joined(node);
        }
        Ok(())
    }

    /// Unregisters a peer. Returns false if it was not registered.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::PeerRejected`] for the local node.
    pub fn unregister_peer(&self, id: &NodeId) -> ClusterResult<bool> {
        let _status = self.status.write();
        let removed = self.cluster.nodes.unregister_peer(id)?;
        self.cluster.resmgrs.forget_node(id);
        Ok(removed.is_some())
    }

    /// Registered peers, this node included.
    pub fn registered_peers(&self) -> Vec<Node> {
        let _status = self.status.read();
        self.cluster.nodes.registered_peers()
    }

    /// Online peers, this node included.
    pub fn online_peers(&self) -> Vec<Node> {
        let _status = self.status.read();
        self.cluster.nodes.online_peers()
    }

    /// True iff online peers are a strict majority of registered peers.
    pub fn is_quorum_online(&self) -> bool {
        self.cluster.nodes.is_quorum_online()
    }

    /// True if `count` nodes are a strict majority of registered peers.
    pub fn counts_as_quorum(&self, count: usize) -> bool {
        self.cluster.nodes.counts_as_quorum(count)
    }

    /// Identity of this node.
    pub fn node_info(&self) -> NodeInfo {
        let local = self.cluster.local();
        NodeInfo {
            id: local.id.clone(),
            address: local.address.ip(),
            port: local.port(),
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Queues a transaction on `resource`. Returns the task id.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::NotStarted`] unless started
    /// - [`ClusterError::QuorumNotOnline`] without quorum; nothing is queued
    /// - [`ClusterError::SubmitTimeout`] / [`ClusterError::SubmitInterrupted`]
    pub fn submit(&self, resource: ResourceId, payload: impl Into<Vec<u8>>) -> ClusterResult<TaskId> {
        let status = self.status.read();
        if *status != ClusterStatus::Started {
            return Err(ClusterError::NotStarted);
        }
        self.coordinator
            .submit(Request::new(resource, payload.into()))
    }

    /// Cancels a task. Authoritative while queued, best effort once
    /// running. Returns false if the task is neither.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let _status = self.status.read();
        self.coordinator.cancel(task_id)
    }

    /// Highest completed transaction id known here. Never decreases.
    pub fn last_complete_tx_id(&self) -> TxId {
        self.cluster.last_complete_tx_id()
    }

    /// Last completed transaction id of one resource manager.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::UnknownResource`] if it is not registered.
    pub fn last_complete_tx_id_for(&self, resource: &ResourceId) -> ClusterResult<TxId> {
        self.cluster
            .resmgrs
            .get(resource)
            .map(|entry| entry.last_tx_id())
            .ok_or_else(|| ClusterError::UnknownResource(resource.clone()))
    }

    /// Number of queued requests.
    pub fn pending_count(&self) -> usize {
        self.coordinator.pending_count()
    }

    /// The request at the head of the queue.
    pub fn peek_pending(&self) -> Option<Request> {
        self.coordinator.peek_pending()
    }

    /// Every queued request, oldest first.
    pub fn pending_requests(&self) -> Vec<Request> {
        self.coordinator.pending()
    }

    /// Free admission slots.
    pub fn available_permits(&self) -> usize {
        self.coordinator.available_permits()
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Every indexed task.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.cluster.tasks.list()
    }

    /// Looks a task up, falling back to the journals once its index entry
    /// was purged.
    pub fn task(&self, task_id: TaskId) -> Option<TaskRecord> {
        if let Some(record) = self.cluster.tasks.get(task_id) {
            return Some(record);
        }
        if task_id == TaskId::nil() {
            return None;
        }
        self.cluster.resmgrs.entries().iter().find_map(|entry| {
            match entry.journal.find_task(task_id) {
                Ok(found) => found.map(|record| TaskRecord::from_journal(entry.id.clone(), &record)),
                Err(e) => {
                    warn!(resource = %entry.id, error = %e, "journal task lookup failed");
                    None
                }
            }
        })
    }

    /// Indexed tasks of one resource manager.
    pub fn tasks_for(&self, resource: &ResourceId) -> Vec<TaskRecord> {
        self.cluster.tasks.for_resource(resource)
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Subscribes a listener to cluster events.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Spawn`] if its delivery thread cannot start.
    pub fn subscribe(&self, listener: Arc<dyn ClusterListener>) -> ClusterResult<SubscriptionId> {
        self.cluster.events.subscribe(listener)
    }

    /// Removes a subscription. Returns false if it is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cluster.events.unsubscribe(id)
    }

    /// Events no listener accepted.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.cluster.events.dead_letters()
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Runs one discovery round against `targets`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotStarted`] unless started.
    pub fn discover_res_mgr_status(
        &self,
        known: &BTreeMap<ResourceId, TxId>,
        targets: &[Node],
    ) -> ClusterResult<DiscoveryOutcome> {
        let status = self.status.read();
        if *status != ClusterStatus::Started {
            return Err(ClusterError::NotStarted);
        }
        Ok(self.cluster.discover_res_mgr_status(known, targets))
    }

    /// Replays `(last_local, target_tx]` from `target` into the local
    /// resource manager. Returns the local last completed id afterwards.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::NotStarted`] unless started
    /// - [`ClusterError::UnknownResource`] if the resource is not registered
    /// - [`ClusterError::JournalGap`] if the peer does not hold `target_tx`
    /// - [`ClusterError::Transport`] if the peer cannot be reached
    pub fn synchronize_with_node(
        &self,
        resource: &ResourceId,
        target: &Node,
        last_local: TxId,
        target_tx: TxId,
    ) -> ClusterResult<TxId> {
        let status = self.status.read();
        if *status != ClusterStatus::Started {
            return Err(ClusterError::NotStarted);
        }
        self.cluster
            .synchronize_with_node(resource, target, last_local, target_tx)
    }

    /// Last known completed id per peer for one resource.
    pub fn cluster_view(&self, resource: &ResourceId) -> BTreeMap<NodeId, TxId> {
        self.cluster.resmgrs.cluster_view(resource)
    }

    /// Number of peers known to have completed `tx_id` on `resource`.
    pub fn peers_reflecting(&self, resource: &ResourceId, tx_id: TxId) -> usize {
        self.cluster.resmgrs.peers_reflecting(resource, tx_id)
    }

    /// Schedules a synchronization round now.
    pub fn trigger_sync(&self) {
        self.cluster.sync_trigger.trigger();
    }

    // =========================================================================
    // Reentrancy
    // =========================================================================

    /// A view for resource manager callbacks that skips the lifecycle lock.
    pub fn reentrant<'a>(&'a self, ctx: &'a TxContext) -> ReentrantManager<'a> {
        ReentrantManager { manager: self, ctx }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if *self.status.get_mut() != ClusterStatus::NotInitialized {
            if let Err(e) = self.fini() {
                warn!(error = %e, "fini on drop failed");
            }
        }
    }
}

/// [`Manager`] as seen from inside a transaction step.
///
/// The caller of the step may hold the lifecycle lock, so nothing here
/// takes it. State may change concurrently.
pub struct ReentrantManager<'a> {
    manager: &'a Manager,
    ctx: &'a TxContext,
}

impl ReentrantManager<'_> {
    /// The transaction this view was created for.
    pub fn context(&self) -> &TxContext {
        self.ctx
    }

    /// True while the node serves transactions.
    pub fn is_started(&self) -> bool {
        self.manager.cluster.is_serving()
    }

    /// Queues a transaction, like [`Manager::submit`].
    ///
    /// # Errors
    ///
    /// Same as [`Manager::submit`].
    pub fn submit(&self, resource: ResourceId, payload: impl Into<Vec<u8>>) -> ClusterResult<TaskId> {
        self.manager
            .coordinator
            .submit(Request::new(resource, payload.into()))
    }

    /// Cancels a queued or running task.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.manager.coordinator.cancel(task_id)
    }

    /// Always fails: a node cannot stop from inside a transaction.
    ///
    /// # Errors
    ///
    /// Always [`ClusterError::StopWithinTransaction`].
    pub fn stop(&self) -> ClusterResult<()> {
        Err(ClusterError::StopWithinTransaction)
    }

    /// See [`Manager::last_complete_tx_id`].
    pub fn last_complete_tx_id(&self) -> TxId {
        self.manager.last_complete_tx_id()
    }

    /// See [`Manager::res_mgrs`].
    pub fn res_mgrs(&self) -> Vec<ResMgrInfo> {
        self.manager.res_mgrs_unlocked()
    }

    /// See [`Manager::res_mgr`].
    pub fn res_mgr(&self, id: &ResourceId) -> Option<ResMgrInfo> {
        self.manager.res_mgr_unlocked(id)
    }

    /// Online peers, this node included.
    pub fn online_peers(&self) -> Vec<Node> {
        self.manager.cluster.nodes.online_peers()
    }

    /// See [`Manager::task`].
    pub fn task(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.manager.task(task_id)
    }

    /// See [`Manager::pending_count`].
    pub fn pending_count(&self) -> usize {
        self.manager.pending_count()
    }
}
