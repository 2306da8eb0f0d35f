//! Synchronization engine.
//!
//! A resource manager only takes part in transactions once it is
//! `UP_TO_DATE`. Getting there is a discovery round (ask every online
//! node for its highest journaled transaction id per resource manager),
//! then a catch-up from a node holding the cluster maximum, then the
//! resource manager's post-sync hook. It is only declared `UP_TO_DATE`
//! once a quorum of nodes is known to hold its highest committed id:
//!
//! ```text
//! UNDETERMINED ─▶ LATE ─▶ SYNCHRONIZING ─▶ POST_SYNC_PROCESSING ─▶ UP_TO_DATE
//!       │                                          ▲
//!       └──────────── already at the maximum ──────┘
//! ```
//!
//! Any failure on the way sends the resource manager back to
//! `UNDETERMINED` and the next round starts over. So does learning that a
//! quorum of peers is ahead of an `UP_TO_DATE` resource manager.
//!
//! Every round also settles holes: ids below a journal's highest id that
//! were never journaled locally. See [`Cluster::close_holes`].

use crate::cluster::Cluster;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, ClusterListener, ListenerResult};
use crate::resmgr::ResMgrEntry;
use crate::status::SyncState;
use crate::transport::call_with_retry;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use txmesh_protocol::{
    JournalRecord, Node, NodeId, RemoteOp, RemoteReply, ResourceId, TaskId, TxId,
};

/// Holes asked about per resource manager and round.
const HOLE_BATCH: usize = 64;

/// Result of one discovery round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// Highest journaled transaction id per resource manager, per
    /// responding node.
    pub responses: BTreeMap<NodeId, BTreeMap<ResourceId, TxId>>,
    /// Number of nodes that answered, the local node included.
    pub response_count: usize,
    /// True if the responders form a strict majority of the registered
    /// peers while quorum is online.
    pub quorum: bool,
}

impl DiscoveryOutcome {
    /// Highest id any responder reported for `resource`.
    #[must_use]
    pub fn cluster_max(&self, resource: &ResourceId) -> TxId {
        self.responses
            .values()
            .filter_map(|view| view.get(resource).copied())
            .max()
            .unwrap_or(TxId::NONE)
    }

    /// Responders other than `local` that reported at least `tx_id` for
    /// `resource`, best first.
    #[must_use]
    pub fn sources(&self, resource: &ResourceId, tx_id: TxId, local: &NodeId) -> Vec<NodeId> {
        let mut sources: Vec<(TxId, &NodeId)> = self
            .responses
            .iter()
            .filter(|(node, _)| *node != local)
            .filter_map(|(node, view)| view.get(resource).map(|last| (*last, node)))
            .filter(|(last, _)| *last >= tx_id)
            .collect();
        sources.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        sources.into_iter().map(|(_, node)| node.clone()).collect()
    }
}

impl Cluster {
    /// Asks every target for its highest journaled transaction ids.
    ///
    /// The local node, if among the targets, answers without a call.
    /// Answers are merged into the cluster update map.
    pub(crate) fn discover_res_mgr_status(
        &self,
        known: &BTreeMap<ResourceId, TxId>,
        targets: &[Node],
    ) -> DiscoveryOutcome {
        let local = self.local().id.clone();
        let op = RemoteOp::Discover {
            known: known.clone(),
        };
        let timeout = self.config.discovery_timeout;

        let answers: Vec<(NodeId, Option<BTreeMap<ResourceId, TxId>>)> = thread::scope(|scope| {
            let pending: Vec<_> = targets
                .iter()
                .map(|target| {
                    let op = &op;
                    let local = &local;
                    scope.spawn(move || {
                        if &target.id == local {
                            return (target.id.clone(), Some(self.resmgrs.last_tx_map()));
                        }
                        match call_with_retry(
                            self.transport.as_ref(),
                            target,
                            op,
                            timeout,
                            &self.config.retry,
                        ) {
                            Ok(RemoteReply::Status { last_tx }) => (target.id.clone(), Some(last_tx)),
                            Ok(other) => {
                                debug!(peer = %target.id, reply = ?other, "unexpected discovery reply");
                                (target.id.clone(), None)
                            }
                            Err(e) => {
                                debug!(peer = %target.id, error = %e, "discovery call failed");
                                (target.id.clone(), None)
                            }
                        }
                    })
                })
                .collect();
            pending
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .collect()
        });

        let mut outcome = DiscoveryOutcome::default();
        for (node, view) in answers {
            let Some(view) = view else { continue };
            for (resource, tx_id) in &view {
                self.resmgrs.record_update(resource, &node, *tx_id);
            }
            outcome.responses.insert(node, view);
        }
        outcome.response_count = outcome.responses.len();
        self.merge_counters(&outcome);
        outcome.quorum =
            self.nodes.is_quorum_online() && self.nodes.counts_as_quorum(outcome.response_count);

        debug!(
            targets = targets.len(),
            responses = outcome.response_count,
            quorum = outcome.quorum,
            "discovery round finished"
        );
        outcome
    }

    /// Raises every resource's shared counter to the highest id reported,
    /// so new transaction ids never collide with completed ones.
    fn merge_counters(&self, outcome: &DiscoveryOutcome) {
        let mut highest: BTreeMap<&ResourceId, TxId> = BTreeMap::new();
        for view in outcome.responses.values() {
            for (resource, tx_id) in view {
                let slot = highest.entry(resource).or_insert(TxId::NONE);
                *slot = (*slot).max(*tx_id);
            }
        }
        for (resource, tx_id) in highest {
            if tx_id.is_none() {
                continue;
            }
            self.observe_completed(tx_id);
            if let Err(e) = self.tx_counter(resource).fetch_max(tx_id.as_i64()) {
                debug!(%resource, error = %e, "could not merge transaction counter");
            }
        }
    }

    /// Replays the journal of `target` over `(last_local, target_tx]` into
    /// the local resource manager. Returns the local last completed id
    /// afterwards.
    ///
    /// Returns immediately, without calling `target`, if nothing is
    /// missing. Entries already journaled here are skipped, so replaying
    /// the same range twice is harmless. The range may have holes, but
    /// `target` must hold `target_tx` itself.
    pub(crate) fn synchronize_with_node(
        &self,
        resource: &ResourceId,
        target: &Node,
        last_local: TxId,
        target_tx: TxId,
    ) -> ClusterResult<TxId> {
        let entry = self
            .resmgrs
            .get(resource)
            .ok_or_else(|| ClusterError::UnknownResource(resource.clone()))?;
        if last_local >= target_tx {
            return Ok(entry.last_tx_id());
        }

        let op = RemoteOp::FetchJournal {
            resource: resource.clone(),
            after: last_local,
            up_to: target_tx,
        };
        let reply = call_with_retry(
            self.transport.as_ref(),
            target,
            &op,
            self.config.call_timeout,
            &self.config.retry,
        )?;
        let records = match reply {
            RemoteReply::Journal { records } => records,
            RemoteReply::Refused(result) => {
                return Err(ClusterError::transport(
                    format!("{} refused journal fetch: {result}", target.id),
                    false,
                ))
            }
            other => {
                return Err(ClusterError::transport(
                    format!("unexpected reply to journal fetch: {other:?}"),
                    false,
                ))
            }
        };

        let mut previous = last_local;
        for record in &records {
            let tx_id = record.tx_id();
            if tx_id <= previous || tx_id > target_tx {
                return Err(ClusterError::transport(
                    format!("{} served {tx_id} out of order", target.id),
                    false,
                ));
            }
            previous = tx_id;
        }
        if previous != target_tx {
            return Err(ClusterError::JournalGap {
                resource: resource.clone(),
                expected: last_local.distance_to(target_tx),
                actual: records.len() as u64,
            });
        }

        let mut applied = 0usize;
        for record in &records {
            if self.apply_replayed(&entry, record)? {
                applied += 1;
            }
        }
        info!(
            %resource,
            peer = %target.id,
            from = %last_local,
            to = %target_tx,
            applied,
            "journal range replayed"
        );
        Ok(entry.last_tx_id())
    }

    fn apply_replayed(&self, entry: &ResMgrEntry, record: &JournalRecord) -> ClusterResult<bool> {
        let tx_id = record.tx_id();
        if entry.has_completed(tx_id) {
            return Ok(false);
        }

        // Superseded by the cluster outcome
        if let Some(inflight) = entry.take_inflight(tx_id) {
            inflight.cancel_monitor();
            let result = entry.rm.rollback(&inflight.context());
            if !result.is_success() {
                warn!(resource = %entry.id, %tx_id, %result, "discarding staged transaction failed");
            }
        }

        if let JournalRecord::Committed(journal_entry) = record {
            let result = entry.rm.replay(journal_entry);
            if !result.is_success() {
                return Err(ClusterError::ReplayFailed {
                    resource: entry.id.clone(),
                    tx_id,
                    message: result.to_string(),
                });
            }
        }
        self.journal_outcome(entry, record)?;
        Ok(true)
    }

    /// Runs the post-sync hook and settles the resulting state.
    pub(crate) fn run_post_sync(&self, entry: &ResMgrEntry) -> ClusterResult<SyncState> {
        self.resmgrs.begin_post_sync(entry)?;
        let result = entry.rm.post_sync();
        if !result.is_success() {
            warn!(resource = %entry.id, %result, "post-sync hook failed");
        }
        let reflected = self.reflected_by_quorum(entry);
        if !reflected {
            debug!(resource = %entry.id, "quorum lost track of the local journal during post-sync");
        }
        self.resmgrs
            .finish_post_sync(entry, result.is_success() && reflected)
    }

    /// True if a quorum of nodes is known to hold the highest locally
    /// committed id. Rollback markers above it need no replication.
    fn reflected_by_quorum(&self, entry: &ResMgrEntry) -> bool {
        let committed = match entry.journal.last_committed_tx_id() {
            Ok(tx_id) => tx_id,
            Err(e) => {
                warn!(resource = %entry.id, error = %e, "could not read the journal tail");
                entry.high_tx_id()
            }
        };
        let reflecting = self.resmgrs.peers_reflecting(&entry.id, committed);
        self.nodes.counts_as_quorum(reflecting)
    }

    /// Sends an `UP_TO_DATE` resource manager back to `UNDETERMINED` once a
    /// quorum of peers reports an id it has not journaled.
    pub(crate) fn fall_back_if_behind(&self, entry: &ResMgrEntry) {
        if entry.state() != SyncState::UpToDate {
            return;
        }
        let ahead = self
            .resmgrs
            .peers_reflecting(&entry.id, entry.high_tx_id().next());
        if self.nodes.counts_as_quorum(ahead) {
            self.resmgrs
                .mark_undetermined(entry, "a quorum of peers is ahead");
        }
    }

    /// Drives every resource manager that is not `UP_TO_DATE` one step
    /// closer to it, using a discovery round's answers.
    pub(crate) fn advance(&self, outcome: &DiscoveryOutcome) {
        if !outcome.quorum {
            debug!(
                responses = outcome.response_count,
                "discovery reached no quorum, not advancing"
            );
            return;
        }

        for entry in self.resmgrs.entries() {
            self.fall_back_if_behind(&entry);
            if entry.state() != SyncState::Undetermined {
                continue;
            }
            match self.advance_one(&entry, outcome) {
                Ok(state) => debug!(resource = %entry.id, %state, "synchronization step done"),
                Err(e) => {
                    warn!(resource = %entry.id, error = %e, "synchronization failed");
                    self.resmgrs.mark_undetermined(&entry, "synchronization failed");
                }
            }
        }
    }

    fn advance_one(&self, entry: &ResMgrEntry, outcome: &DiscoveryOutcome) -> ClusterResult<SyncState> {
        let local_last = entry.last_tx_id();
        let cluster_max = outcome.cluster_max(&entry.id);
        if local_last < cluster_max {
            self.catch_up(entry, outcome, cluster_max)?;
            if entry.state() != SyncState::Synchronizing {
                // Reset while replaying
                return Ok(entry.state());
            }
            self.resmgrs
                .record_update(&entry.id, &self.local().id, entry.high_tx_id());
        }

        if !self.reflected_by_quorum(entry) {
            debug!(
                resource = %entry.id,
                high = %entry.high_tx_id(),
                "waiting for a quorum to hold the local journal"
            );
            self.resmgrs
                .mark_undetermined(entry, "local journal not held by a quorum");
            return Ok(entry.state());
        }
        self.run_post_sync(entry)
    }

    fn catch_up(
        &self,
        entry: &ResMgrEntry,
        outcome: &DiscoveryOutcome,
        cluster_max: TxId,
    ) -> ClusterResult<()> {
        let local_last = entry.last_tx_id();
        self.resmgrs.transition(entry, SyncState::Late)?;
        info!(resource = %entry.id, local = %local_last, cluster = %cluster_max, "resource manager is late");
        self.resmgrs.transition(entry, SyncState::Synchronizing)?;

        let mut last_error = None;
        for source in outcome.sources(&entry.id, cluster_max, &self.local().id) {
            let Some(node) = self.nodes.registered(&source) else {
                continue;
            };
            match self.synchronize_with_node(&entry.id, &node, entry.last_tx_id(), cluster_max) {
                Ok(_) if entry.high_tx_id() >= cluster_max => {
                    last_error = None;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(resource = %entry.id, peer = %source, error = %e, "catch-up source failed");
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }

        self.close_holes(entry)?;
        let reached = entry.last_tx_id();
        if reached < cluster_max {
            return Err(ClusterError::JournalGap {
                resource: entry.id.clone(),
                expected: local_last.distance_to(cluster_max),
                actual: local_last.distance_to(reached),
            });
        }
        Ok(())
    }

    // =========================================================================
    // Holes
    // =========================================================================

    /// Settles ids below the highest journaled id that were never journaled
    /// here.
    ///
    /// Every online peer is asked about each hole. A record held anywhere is
    /// replayed. A hole no responder holds, and that a quorum of nodes does
    /// not have in flight, belongs to a transaction id that was taken but
    /// never used. Once it has stayed that way for the transaction timeout
    /// it is journaled as rolled back.
    pub(crate) fn close_holes(&self, entry: &ResMgrEntry) -> ClusterResult<()> {
        let holes = entry.journal.holes(HOLE_BATCH);
        if holes.is_empty() || !self.nodes.is_quorum_online() {
            return Ok(());
        }

        let local = &self.local().id;
        let mut held: BTreeMap<TxId, JournalRecord> = BTreeMap::new();
        let mut busy: BTreeMap<TxId, usize> = BTreeMap::new();
        let mut responders = 1usize;
        for peer in self.nodes.online_peers().iter().filter(|n| &n.id != local) {
            let op = RemoteOp::Resolve {
                resource: entry.id.clone(),
                tx_ids: holes.clone(),
            };
            match call_with_retry(
                self.transport.as_ref(),
                peer,
                &op,
                self.config.call_timeout,
                &self.config.retry,
            ) {
                Ok(RemoteReply::Resolution { records, in_flight }) => {
                    responders += 1;
                    for record in records {
                        held.entry(record.tx_id()).or_insert(record);
                    }
                    for tx_id in in_flight {
                        *busy.entry(tx_id).or_default() += 1;
                    }
                }
                Ok(other) => debug!(peer = %peer.id, reply = ?other, "unexpected resolve reply"),
                Err(e) => debug!(peer = %peer.id, error = %e, "resolve call failed"),
            }
        }

        for tx_id in holes {
            if let Some(record) = held.get(&tx_id) {
                self.orphans.lock().remove(&(entry.id.clone(), tx_id));
                if self.apply_replayed(entry, record)? {
                    info!(resource = %entry.id, %tx_id, "hole filled from a peer");
                }
                continue;
            }

            let busy_here = usize::from(entry.is_inflight(tx_id));
            let absent = responders
                .saturating_sub(busy_here)
                .saturating_sub(busy.get(&tx_id).copied().unwrap_or(0));
            if !self.nodes.counts_as_quorum(absent) {
                self.orphans.lock().remove(&(entry.id.clone(), tx_id));
                continue;
            }

            let since = *self
                .orphans
                .lock()
                .entry((entry.id.clone(), tx_id))
                .or_insert_with(Instant::now);
            if since.elapsed() < self.config.tx_timeout {
                continue;
            }
            self.orphans.lock().remove(&(entry.id.clone(), tx_id));
            warn!(resource = %entry.id, %tx_id, "transaction id was never used, journaling a rollback");
            let record = JournalRecord::RolledBack {
                tx_id,
                task_id: TaskId::nil(),
            };
            self.journal_outcome(entry, &record)?;
        }
        Ok(())
    }

    /// One background round: settle holes, then discover and advance.
    pub(crate) fn sync_round(&self) {
        for entry in self.resmgrs.entries() {
            if let Err(e) = self.close_holes(&entry) {
                warn!(resource = %entry.id, error = %e, "could not settle journal holes");
            }
        }

        let pending = self
            .resmgrs
            .entries()
            .iter()
            .any(|entry| entry.state() == SyncState::Undetermined);
        if !pending {
            return;
        }
        let known = self.resmgrs.last_tx_map();
        let targets = self.nodes.online_peers();
        let outcome = self.discover_res_mgr_status(&known, &targets);
        self.advance(&outcome);
    }
}

#[derive(Debug, Default)]
struct TriggerState {
    pending: bool,
    stopped: bool,
}

/// Wakes the synchronizer thread.
#[derive(Debug, Default)]
pub(crate) struct SyncTrigger {
    state: Mutex<TriggerState>,
    cv: Condvar,
}

impl SyncTrigger {
    pub fn trigger(&self) {
        self.state.lock().pending = true;
        self.cv.notify_all();
    }

    /// Waits for a trigger or `interval`. Returns false once stopped.
    fn wait(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.pending && !state.stopped {
            self.cv.wait_for(&mut state, interval);
        }
        state.pending = false;
        !state.stopped
    }

    fn set_stopped(&self, stopped: bool) {
        self.state.lock().stopped = stopped;
        self.cv.notify_all();
    }
}

/// Background thread running [`Cluster::sync_round`] whenever triggered,
/// and at least every sync interval.
pub(crate) struct Synchronizer {
    cluster: Arc<Cluster>,
    handle: Option<JoinHandle<()>>,
}

impl Synchronizer {
    pub fn start(cluster: Arc<Cluster>) -> ClusterResult<Self> {
        cluster.sync_trigger.set_stopped(false);
        cluster.sync_trigger.trigger();

        let thread_cluster = Arc::clone(&cluster);
        let handle = thread::Builder::new()
            .name("txmesh-sync".to_string())
            .spawn(move || {
                let interval = thread_cluster.config.sync_interval;
                while thread_cluster.sync_trigger.wait(interval) {
                    thread_cluster.sync_round();
                }
                debug!("synchronizer stopped");
            })
            .map_err(|_| ClusterError::Spawn("synchronizer"))?;

        Ok(Self {
            cluster,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.cluster.sync_trigger.set_stopped(true);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("synchronizer thread panicked");
            }
        }
    }
}

/// Reacts to membership and state changes by scheduling a sync round.
pub(crate) struct SyncListener {
    cluster: Weak<Cluster>,
}

impl SyncListener {
    pub fn new(cluster: Weak<Cluster>) -> Self {
        Self { cluster }
    }
}

impl ClusterListener for SyncListener {
    fn on_event(&self, event: &ClusterEvent) -> ListenerResult {
        let Some(cluster) = self.cluster.upgrade() else {
            return Ok(());
        };
        match event {
            ClusterEvent::PeerOnline { .. } => cluster.sync_trigger.trigger(),
            ClusterEvent::PeerOffline { node, quorum } => {
                cluster.resmgrs.forget_node(&node.id);
                if !quorum {
                    for entry in cluster.resmgrs.entries() {
                        cluster.resmgrs.mark_undetermined(&entry, "quorum lost");
                    }
                    cluster.sync_trigger.trigger();
                }
            }
            ClusterEvent::ResMgrStateChanged {
                to: SyncState::Undetermined,
                ..
            } => cluster.sync_trigger.trigger(),
            _ => {}
        }
        Ok(())
    }
}
