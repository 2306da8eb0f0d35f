//! Resource manager registry and synchronization state.

use crate::context::TxContext;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, EventBus};
use crate::monitor::MonitorHandle;
use crate::status::SyncState;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use txmesh_journal::Journal;
use txmesh_protocol::{JournalEntry, NodeId, OpResult, ResourceId, Transaction, TxId};

/// The pluggable unit that performs a transaction's effect.
///
/// Every step returns a structured [`OpResult`]; a non-zero code on
/// `prepare` is a vote to roll back. Journaling is done by the
/// coordinator: a resource manager only stages and applies effects.
pub trait ResourceManager: Send + Sync {
    /// Identifier the resource manager is registered under.
    fn id(&self) -> ResourceId;

    /// Receives the payload and the frozen participant set.
    fn start(&self, ctx: &TxContext, transaction: &Transaction) -> OpResult;

    /// Validates and stages the effect.
    fn prepare(&self, ctx: &TxContext) -> OpResult;

    /// Makes the staged effect durable.
    fn commit(&self, ctx: &TxContext) -> OpResult;

    /// Discards the staged effect. Must tolerate unknown transactions.
    fn rollback(&self, ctx: &TxContext) -> OpResult;

    /// Applies a committed journal entry received during synchronization.
    fn replay(&self, entry: &JournalEntry) -> OpResult;

    /// Idempotent validation run before the resource manager is trusted.
    fn post_sync(&self) -> OpResult {
        OpResult::ok()
    }
}

/// A transaction started locally and not yet journaled.
pub(crate) struct Inflight {
    pub transaction: Transaction,
    pub monitor: Option<MonitorHandle>,
}

impl Inflight {
    pub fn context(&self) -> TxContext {
        TxContext::new(
            self.transaction.tx_id,
            self.transaction.resource.clone(),
            self.transaction.task_id,
        )
    }

    pub fn cancel_monitor(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.cancel();
        }
    }
}

#[derive(Debug)]
struct StateCell {
    state: SyncState,
    post_sync_running: bool,
    reset_requested: bool,
}

/// One registered resource manager.
pub(crate) struct ResMgrEntry {
    pub id: ResourceId,
    pub rm: Arc<dyn ResourceManager>,
    pub journal: Arc<Journal>,
    cell: Mutex<StateCell>,
    inflight: Mutex<BTreeMap<TxId, Inflight>>,
}

impl ResMgrEntry {
    pub fn state(&self) -> SyncState {
        self.cell.lock().state
    }

    /// Last completed transaction id, from the journal.
    pub fn last_tx_id(&self) -> TxId {
        self.journal.last_tx_id()
    }

    /// Highest journaled transaction id, holes below it included.
    pub fn high_tx_id(&self) -> TxId {
        self.journal.max_tx_id()
    }

    pub fn has_completed(&self, tx_id: TxId) -> bool {
        self.journal.contains(tx_id)
    }

    pub fn insert_inflight(&self, inflight: Inflight) {
        self.inflight
            .lock()
            .insert(inflight.transaction.tx_id, inflight);
    }

    pub fn is_inflight(&self, tx_id: TxId) -> bool {
        self.inflight.lock().contains_key(&tx_id)
    }

    pub fn inflight_context(&self, tx_id: TxId) -> Option<TxContext> {
        self.inflight.lock().get(&tx_id).map(Inflight::context)
    }

    pub fn take_inflight(&self, tx_id: TxId) -> Option<Inflight> {
        self.inflight.lock().remove(&tx_id)
    }

    pub fn drain_inflight(&self) -> Vec<Inflight> {
        std::mem::take(&mut *self.inflight.lock())
            .into_values()
            .collect()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Maps resource ids to resource managers and their sync state, and
/// holds the cluster update map.
pub(crate) struct ResMgrRegistry {
    entries: RwLock<BTreeMap<ResourceId, Arc<ResMgrEntry>>>,
    /// resource -> peer -> last completed transaction id
    cluster_updates: Mutex<BTreeMap<ResourceId, BTreeMap<NodeId, TxId>>>,
    events: Arc<EventBus>,
}

impl ResMgrRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            cluster_updates: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    /// Registers a resource manager in `UNDETERMINED`.
    pub fn register(
        &self,
        rm: Arc<dyn ResourceManager>,
        journal: Arc<Journal>,
    ) -> ClusterResult<Arc<ResMgrEntry>> {
        let id = rm.id();
        let entry = {
            let mut entries = self.entries.write();
            if entries.contains_key(&id) {
                return Err(ClusterError::AlreadyRegistered(id.to_string()));
            }
            let entry = Arc::new(ResMgrEntry {
                id: id.clone(),
                rm,
                journal,
                cell: Mutex::new(StateCell {
                    state: SyncState::Unregistered,
                    post_sync_running: false,
                    reset_requested: false,
                }),
                inflight: Mutex::new(BTreeMap::new()),
            });
            entries.insert(id.clone(), Arc::clone(&entry));
            entry
        };

        info!(resource = %id, last_tx = %entry.last_tx_id(), "resource manager registered");
        self.transition(&entry, SyncState::Undetermined)?;
        Ok(entry)
    }

    /// Removes a resource manager. Steps already running keep their
    /// reference and finish.
    pub fn unregister(&self, id: &ResourceId) -> ClusterResult<Arc<ResMgrEntry>> {
        let entry = self
            .entries
            .write()
            .remove(id)
            .ok_or_else(|| ClusterError::UnknownResource(id.clone()))?;
        self.cluster_updates.lock().remove(id);
        self.transition(&entry, SyncState::Unregistered)?;
        info!(resource = %id, "resource manager unregistered");
        Ok(entry)
    }

    pub fn get(&self, id: &ResourceId) -> Option<Arc<ResMgrEntry>> {
        self.entries.read().get(id).cloned()
    }

    pub fn entries(&self) -> Vec<Arc<ResMgrEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Highest journaled transaction id of every registered resource
    /// manager.
    pub fn last_tx_map(&self) -> BTreeMap<ResourceId, TxId> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.high_tx_id()))
            .collect()
    }

    /// Moves a resource manager to `to`, validating the transition.
    ///
    /// Returns the previous state.
    pub fn transition(&self, entry: &ResMgrEntry, to: SyncState) -> ClusterResult<SyncState> {
        let from = {
            let mut cell = entry.cell.lock();
            let from = cell.state;
            if from == to {
                return Ok(from);
            }
            if !from.can_transition_to(to) {
                return Err(ClusterError::InvalidStateTransition { from, to });
            }
            cell.state = to;
            if to != SyncState::PostSyncProcessing {
                cell.post_sync_running = false;
            }
            from
        };
        self.announce(entry, from, to);
        Ok(from)
    }

    fn announce(&self, entry: &ResMgrEntry, from: SyncState, to: SyncState) {
        info!(resource = %entry.id, %from, %to, last_tx = %entry.last_tx_id(), "resource manager state changed");
        self.events.publish(ClusterEvent::ResMgrStateChanged {
            resource: entry.id.clone(),
            from,
            to,
        });
    }

    /// Forces a resource manager back to `UNDETERMINED`.
    ///
    /// While the post-sync hook runs, the request is recorded instead and
    /// the hook's outcome is discarded.
    pub fn mark_undetermined(&self, entry: &ResMgrEntry, reason: &str) {
        let from = {
            let mut cell = entry.cell.lock();
            match cell.state {
                SyncState::Unregistered | SyncState::Undetermined => return,
                SyncState::PostSyncProcessing if cell.post_sync_running => {
                    debug!(resource = %entry.id, reason, "reset requested during post-sync");
                    cell.reset_requested = true;
                    return;
                }
                from => {
                    cell.state = SyncState::Undetermined;
                    cell.post_sync_running = false;
                    from
                }
            }
        };
        info!(resource = %entry.id, reason, "resource manager marked undetermined");
        self.announce(entry, from, SyncState::Undetermined);
    }

    /// Enters `POST_SYNC_PROCESSING` with the hook marked running.
    pub fn begin_post_sync(&self, entry: &ResMgrEntry) -> ClusterResult<()> {
        let from = {
            let mut cell = entry.cell.lock();
            let from = cell.state;
            if !from.can_transition_to(SyncState::PostSyncProcessing) {
                return Err(ClusterError::InvalidStateTransition {
                    from,
                    to: SyncState::PostSyncProcessing,
                });
            }
            cell.state = SyncState::PostSyncProcessing;
            cell.post_sync_running = true;
            cell.reset_requested = false;
            from
        };
        self.announce(entry, from, SyncState::PostSyncProcessing);
        Ok(())
    }

    /// Leaves `POST_SYNC_PROCESSING` once the hook returned.
    ///
    /// Goes to `UP_TO_DATE` only if the hook succeeded and no reset was
    /// requested while it ran. Returns the new state.
    pub fn finish_post_sync(&self, entry: &ResMgrEntry, hook_ok: bool) -> ClusterResult<SyncState> {
        let to = {
            let mut cell = entry.cell.lock();
            if cell.state != SyncState::PostSyncProcessing {
                let from = cell.state;
                return Err(ClusterError::InvalidStateTransition {
                    from,
                    to: SyncState::UpToDate,
                });
            }
            let reset = std::mem::take(&mut cell.reset_requested);
            cell.post_sync_running = false;
            let to = if hook_ok && !reset {
                SyncState::UpToDate
            } else {
                SyncState::Undetermined
            };
            cell.state = to;
            to
        };
        self.announce(entry, SyncState::PostSyncProcessing, to);
        Ok(to)
    }

    /// Records a peer's last completed transaction id for a resource.
    pub fn record_update(&self, resource: &ResourceId, node: &NodeId, tx_id: TxId) {
        self.cluster_updates
            .lock()
            .entry(resource.clone())
            .or_default()
            .insert(node.clone(), tx_id);
    }

    /// Last known completed id per peer for one resource.
    pub fn cluster_view(&self, resource: &ResourceId) -> BTreeMap<NodeId, TxId> {
        self.cluster_updates
            .lock()
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of peers known to have completed `tx_id` on `resource`.
    pub fn peers_reflecting(&self, resource: &ResourceId, tx_id: TxId) -> usize {
        self.cluster_updates
            .lock()
            .get(resource)
            .map(|view| view.values().filter(|last| **last >= tx_id).count())
            .unwrap_or(0)
    }

    /// Drops a peer from the cluster update map.
    pub fn forget_node(&self, node: &NodeId) {
        for view in self.cluster_updates.lock().values_mut() {
            view.remove(node);
        }
    }

    pub fn clear_cluster_updates(&self) {
        self.cluster_updates.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ClusterListener, ListenerResult};
    use txmesh_protocol::TaskId;

    struct Noop;

    impl ResourceManager for Noop {
        fn id(&self) -> ResourceId {
            ResourceId::from("blocks")
        }
        fn start(&self, _ctx: &TxContext, _tx: &Transaction) -> OpResult {
            OpResult::ok()
        }
        fn prepare(&self, _ctx: &TxContext) -> OpResult {
            OpResult::ok()
        }
        fn commit(&self, _ctx: &TxContext) -> OpResult {
            OpResult::ok()
        }
        fn rollback(&self, _ctx: &TxContext) -> OpResult {
            OpResult::ok()
        }
        fn replay(&self, _entry: &JournalEntry) -> OpResult {
            OpResult::ok()
        }
    }

    #[derive(Default)]
    struct Transitions(Mutex<Vec<(SyncState, SyncState)>>);

    impl ClusterListener for Transitions {
        fn on_event(&self, event: &ClusterEvent) -> ListenerResult {
            if let ClusterEvent::ResMgrStateChanged { from, to, .. } = event {
                self.0.lock().push((*from, *to));
            }
            Ok(())
        }
    }

    fn registry() -> (ResMgrRegistry, Arc<EventBus>) {
        let events = Arc::new(EventBus::new(1, 4));
        (ResMgrRegistry::new(Arc::clone(&events)), events)
    }

    fn register(registry: &ResMgrRegistry) -> Arc<ResMgrEntry> {
        registry
            .register(Arc::new(Noop), Arc::new(Journal::in_memory()))
            .unwrap()
    }

    #[test]
    fn registration_enters_undetermined() {
        let (registry, _events) = registry();
        let entry = register(&registry);
        assert_eq!(entry.state(), SyncState::Undetermined);
        assert_eq!(entry.last_tx_id(), TxId::NONE);

        let again = registry.register(Arc::new(Noop), Arc::new(Journal::in_memory()));
        assert!(matches!(again, Err(ClusterError::AlreadyRegistered(_))));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let (registry, _events) = registry();
        let entry = register(&registry);
        registry.transition(&entry, SyncState::Late).unwrap();

        let err = registry
            .transition(&entry, SyncState::UpToDate)
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidStateTransition { .. }));
        assert_eq!(entry.state(), SyncState::Late);
    }

    #[test]
    fn post_sync_reaches_up_to_date() {
        let (registry, _events) = registry();
        let entry = register(&registry);

        registry.begin_post_sync(&entry).unwrap();
        assert_eq!(
            registry.finish_post_sync(&entry, true).unwrap(),
            SyncState::UpToDate
        );
    }

    #[test]
    fn reset_during_post_sync_forces_undetermined() {
        let (registry, _events) = registry();
        let entry = register(&registry);

        registry.begin_post_sync(&entry).unwrap();
        registry.mark_undetermined(&entry, "test");
        // Recorded, not applied, while the hook runs
        assert_eq!(entry.state(), SyncState::PostSyncProcessing);

        assert_eq!(
            registry.finish_post_sync(&entry, true).unwrap(),
            SyncState::Undetermined
        );
    }

    #[test]
    fn failed_hook_forces_undetermined() {
        let (registry, _events) = registry();
        let entry = register(&registry);
        registry.begin_post_sync(&entry).unwrap();
        assert_eq!(
            registry.finish_post_sync(&entry, false).unwrap(),
            SyncState::Undetermined
        );
    }

    #[test]
    fn transitions_are_published() {
        let (registry, events) = registry();
        let transitions = Arc::new(Transitions::default());
        let id = events.subscribe(transitions.clone()).unwrap();

        let entry = register(&registry);
        registry.begin_post_sync(&entry).unwrap();
        registry.finish_post_sync(&entry, true).unwrap();
        registry.mark_undetermined(&entry, "test");
        registry.unregister(&entry.id).unwrap();
        events.unsubscribe(id);

        assert_eq!(
            *transitions.0.lock(),
            vec![
                (SyncState::Unregistered, SyncState::Undetermined),
                (SyncState::Undetermined, SyncState::PostSyncProcessing),
                (SyncState::PostSyncProcessing, SyncState::UpToDate),
                (SyncState::UpToDate, SyncState::Undetermined),
                (SyncState::Undetermined, SyncState::Unregistered),
            ]
        );
    }

    #[test]
    fn cluster_update_map() {
        let (registry, _events) = registry();
        let entry = register(&registry);
        let b = NodeId::new("b").unwrap();
        let c = NodeId::new("c").unwrap();

        registry.record_update(&entry.id, &b, TxId::new(7));
        registry.record_update(&entry.id, &c, TxId::new(4));
        assert_eq!(registry.peers_reflecting(&entry.id, TxId::new(5)), 1);
        assert_eq!(registry.cluster_view(&entry.id).len(), 2);

        registry.forget_node(&b);
        assert_eq!(registry.peers_reflecting(&entry.id, TxId::new(5)), 0);

        registry.unregister(&entry.id).unwrap();
        assert!(registry.cluster_view(&entry.id).is_empty());
    }

    #[test]
    fn inflight_bookkeeping() {
        let (registry, _events) = registry();
        let entry = register(&registry);
        let request = txmesh_protocol::Request::new(entry.id.clone(), vec![1]);
        let local: txmesh_protocol::Node = "a@127.0.0.1:7000".parse().unwrap();
        let tx = Transaction::from_request(&request, TxId::new(3), local.id.clone(), vec![local]);

        entry.insert_inflight(Inflight {
            transaction: tx,
            monitor: None,
        });
        assert!(entry.is_inflight(TxId::new(3)));
        let taken = entry.take_inflight(TxId::new(3)).unwrap();
        assert_eq!(taken.context().tx_id(), TxId::new(3));
        assert_ne!(taken.context().task_id(), TaskId::nil());
        assert_eq!(entry.inflight_count(), 0);
    }
}
