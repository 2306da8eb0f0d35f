//! State shared by every coordinator component.

use crate::config::ClusterConfig;
use crate::context::ActiveSteps;
use crate::events::EventBus;
use crate::registry::NodeRegistry;
use crate::resmgr::ResMgrRegistry;
use crate::sync::SyncTrigger;
use crate::tasks::TaskTracker;
use crate::transport::{ClusterTransport, DistributedCounter};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use txmesh_protocol::{Node, ResourceId, TxId};

/// Name of the cluster-wide transaction counter of a resource manager.
pub(crate) fn counter_name(resource: &ResourceId) -> String {
    format!("txmesh.tx.{resource}")
}

/// Everything the coordinator threads share.
///
/// Owned by one [`crate::Manager`]; background threads hold an `Arc` to
/// it, monitors a `Weak`.
pub(crate) struct Cluster {
    pub config: ClusterConfig,
    pub transport: Arc<dyn ClusterTransport>,
    pub nodes: NodeRegistry,
    pub resmgrs: ResMgrRegistry,
    pub tasks: Arc<TaskTracker>,
    pub events: Arc<EventBus>,
    pub sync_trigger: SyncTrigger,
    pub steps: ActiveSteps,
    /// Journal holes no reachable node could account for, with the time
    /// they were first seen that way.
    pub orphans: Mutex<BTreeMap<(ResourceId, TxId), Instant>>,
    /// Highest completed transaction id observed anywhere.
    high_water: AtomicI64,
    /// True while started; incoming calls are refused otherwise.
    serving: AtomicBool,
    me: Weak<Cluster>,
}

impl Cluster {
    pub fn new(config: ClusterConfig, transport: Arc<dyn ClusterTransport>) -> Arc<Self> {
        let events = Arc::new(EventBus::new(
            config.event_delivery_attempts,
            config.dead_letter_capacity,
        ));
        let local = config.local.clone();
        let tasks = Arc::new(TaskTracker::new(
            config.retention.clone(),
            Arc::clone(&events),
        ));

        Arc::new_cyclic(|me| Self {
            nodes: NodeRegistry::new(local, Arc::clone(&events)),
            resmgrs: ResMgrRegistry::new(Arc::clone(&events)),
            tasks,
            events,
            sync_trigger: SyncTrigger::default(),
            steps: ActiveSteps::default(),
            orphans: Mutex::new(BTreeMap::new()),
            config,
            transport,
            high_water: AtomicI64::new(TxId::NONE.as_i64()),
            serving: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn local(&self) -> &Node {
        self.nodes.local()
    }

    pub fn weak(&self) -> Weak<Cluster> {
        self.me.clone()
    }

    pub fn tx_counter(&self, resource: &ResourceId) -> Arc<dyn DistributedCounter> {
        self.transport.counter(&counter_name(resource))
    }

    /// Merges a completed transaction id into the local high-water mark.
    pub fn observe_completed(&self, tx_id: TxId) {
        self.high_water.fetch_max(tx_id.as_i64(), Ordering::SeqCst);
    }

    /// Highest completed transaction id known to this node. Never decreases.
    pub fn last_complete_tx_id(&self) -> TxId {
        let journaled = self
            .resmgrs
            .entries()
            .iter()
            .map(|e| e.last_tx_id().as_i64())
            .max()
            .unwrap_or(TxId::NONE.as_i64());
        let merged = self.high_water.fetch_max(journaled, Ordering::SeqCst).max(journaled);
        TxId::new(merged)
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::SeqCst)
    }

    pub fn set_serving(&self, serving: bool) {
        self.serving.store(serving, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_names_are_per_resource() {
        assert_eq!(counter_name(&ResourceId::from("blocks")), "txmesh.tx.blocks");
        assert_ne!(
            counter_name(&ResourceId::from("blocks")),
            counter_name(&ResourceId::from("meta"))
        );
    }
}
