//! Participant side of the two-phase commit, and the dispatcher for
//! operations arriving from other nodes.

use crate::cluster::Cluster;
use crate::error::ClusterResult;
use crate::monitor::{MonitorTarget, TransactionMonitor};
use crate::resmgr::{Inflight, ResMgrEntry};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};
use txmesh_protocol::{
    JournalEntry, JournalRecord, NodeId, OpCode, OpResult, ProtocolOp, RemoteOp, RemoteReply,
    ResourceId, TaskId, Transaction, TxId,
};

impl Cluster {
    /// Executes one protocol step against the local resource manager.
    pub(crate) fn handle_protocol(&self, op: &ProtocolOp) -> OpResult {
        if !self.is_serving() {
            return OpResult::failure(OpCode::ShuttingDown, "node is not started");
        }
        debug!(op = op.name(), resource = %op.resource(), tx_id = %op.tx_id(), "protocol step");

        match op {
            ProtocolOp::Start { transaction } => self.handle_start(transaction),
            ProtocolOp::Prepare { resource, tx_id } => self.handle_prepare(resource, *tx_id),
            ProtocolOp::Commit { resource, tx_id } => self.handle_commit(resource, *tx_id),
            ProtocolOp::Rollback { resource, tx_id } => self.rollback_local(resource, *tx_id),
        }
    }

    fn lookup(&self, resource: &ResourceId) -> Result<Arc<ResMgrEntry>, OpResult> {
        self.resmgrs.get(resource).ok_or_else(|| {
            OpResult::failure(
                OpCode::NotRegistered,
                format!("resource manager {resource} is not registered"),
            )
        })
    }

    fn ready(entry: &ResMgrEntry) -> Result<(), OpResult> {
        let state = entry.state();
        if state.accepts_transactions() {
            Ok(())
        } else {
            Err(OpResult::failure(
                OpCode::NotReady,
                format!("resource manager {} is {state}", entry.id),
            ))
        }
    }

    fn handle_start(&self, transaction: &Transaction) -> OpResult {
        let entry = match self.lookup(&transaction.resource) {
            Ok(entry) => entry,
            Err(refused) => return refused,
        };
        if let Err(refused) = Self::ready(&entry) {
            return refused;
        }
        let tx_id = transaction.tx_id;
        if entry.has_completed(tx_id) || entry.is_inflight(tx_id) {
            return OpResult::resource_failure(format!("transaction {tx_id} already known"));
        }

        let inflight = Inflight {
            transaction: transaction.clone(),
            monitor: None,
        };
        let ctx = inflight.context();
        let result = {
            let _step = self.steps.enter(&ctx);
            entry.rm.start(&ctx, transaction)
        };

        let target: Weak<dyn MonitorTarget> = self.weak();
        let monitor = TransactionMonitor {
            resource: entry.id.clone(),
            tx_id,
            timeout: self.config.tx_timeout,
            participants: transaction.participants.len(),
        }
        .arm(self.tx_counter(&entry.id), target);
        let monitor = match monitor {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(resource = %entry.id, %tx_id, error = %e, "transaction runs without a monitor");
                None
            }
        };
        entry.insert_inflight(Inflight { monitor, ..inflight });

        if !result.is_success() {
            warn!(resource = %entry.id, %tx_id, %result, "start refused by resource manager");
        }
        result
    }

    fn handle_prepare(&self, resource: &ResourceId, tx_id: TxId) -> OpResult {
        let entry = match self.lookup(resource) {
            Ok(entry) => entry,
            Err(refused) => return refused,
        };
        let Some(ctx) = entry.inflight_context(tx_id) else {
            return OpResult::failure(
                OpCode::UnknownTransaction,
                format!("transaction {tx_id} was not started here"),
            );
        };
        if let Err(refused) = Self::ready(&entry) {
            return refused;
        }

        let result = {
            let _step = self.steps.enter(&ctx);
            entry.rm.prepare(&ctx)
        };
        if !result.is_success() {
            debug!(%resource, %tx_id, %result, "prepare vote is no");
            return result;
        }
        // The monitor may have rolled it back while the vote was pending
        if !entry.is_inflight(tx_id) {
            warn!(%resource, %tx_id, "transaction rolled back while preparing, voting no");
            return OpResult::failure(
                OpCode::UnknownTransaction,
                format!("transaction {tx_id} was rolled back while preparing"),
            );
        }
        result
    }

    fn handle_commit(&self, resource: &ResourceId, tx_id: TxId) -> OpResult {
        let entry = match self.lookup(resource) {
            Ok(entry) => entry,
            Err(refused) => return refused,
        };
        let Some(inflight) = entry.take_inflight(tx_id) else {
            return self.commit_completed(&entry, tx_id);
        };
        inflight.cancel_monitor();

        let ctx = inflight.context();
        let result = {
            let _step = self.steps.enter(&ctx);
            entry.rm.commit(&ctx)
        };
        if !result.is_success() {
            warn!(%resource, %tx_id, %result, "commit failed on resource manager");
            self.resmgrs.mark_undetermined(&entry, "commit failed");
            return result;
        }

        let Transaction {
            task_id, payload, ..
        } = inflight.transaction;
        let record = JournalRecord::Committed(JournalEntry {
            tx_id,
            resource: resource.clone(),
            task_id,
            payload,
        });
        if let Err(e) = self.journal_outcome(&entry, &record) {
            error!(%resource, %tx_id, error = %e, "committed transaction could not be journaled");
            self.resmgrs.mark_undetermined(&entry, "journal append failed");
            return OpResult::resource_failure(format!("journal: {e}"));
        }
        result
    }

    /// Answers a commit for a transaction no longer in flight here.
    ///
    /// A repeated commit is fine. A commit for a transaction this node
    /// already rolled back is refused and the resource manager drops back
    /// to synchronization.
    fn commit_completed(&self, entry: &ResMgrEntry, tx_id: TxId) -> OpResult {
        match entry.journal.get(tx_id) {
            Ok(Some(JournalRecord::Committed(_))) => OpResult::ok(),
            Ok(Some(JournalRecord::RolledBack { .. })) => {
                warn!(resource = %entry.id, %tx_id, "commit arrived after a local rollback");
                self.resmgrs
                    .mark_undetermined(entry, "commit arrived after a local rollback");
                OpResult::failure(
                    OpCode::UnknownTransaction,
                    format!("transaction {tx_id} was already rolled back here"),
                )
            }
            Ok(None) => OpResult::failure(
                OpCode::UnknownTransaction,
                format!("transaction {tx_id} is not in flight"),
            ),
            Err(e) => OpResult::resource_failure(format!("journal: {e}")),
        }
    }

    /// Rolls a transaction back on this node and journals the marker.
    ///
    /// Tolerates transactions that never started here, so every id of the
    /// resource manager ends up in the journal.
    pub(crate) fn rollback_local(&self, resource: &ResourceId, tx_id: TxId) -> OpResult {
        let entry = match self.lookup(resource) {
            Ok(entry) => entry,
            Err(refused) => return refused,
        };

        let inflight = entry.take_inflight(tx_id);
        let task_id = match &inflight {
            Some(inflight) => {
                inflight.cancel_monitor();
                let ctx = inflight.context();
                let result = {
                    let _step = self.steps.enter(&ctx);
                    entry.rm.rollback(&ctx)
                };
                if !result.is_success() {
                    warn!(%resource, %tx_id, %result, "resource manager rollback failed");
                }
                inflight.transaction.task_id
            }
            None => TaskId::nil(),
        };

        if entry.has_completed(tx_id) {
            return OpResult::ok();
        }
        let record = JournalRecord::RolledBack { tx_id, task_id };
        if let Err(e) = self.journal_outcome(&entry, &record) {
            error!(%resource, %tx_id, error = %e, "rollback marker could not be journaled");
            self.resmgrs.mark_undetermined(&entry, "journal append failed");
            return OpResult::resource_failure(format!("journal: {e}"));
        }
        OpResult::ok()
    }

    pub(crate) fn journal_outcome(
        &self,
        entry: &ResMgrEntry,
        record: &JournalRecord,
    ) -> ClusterResult<()> {
        if entry.journal.append(record)? {
            self.observe_completed(record.tx_id());
        }
        Ok(())
    }

    /// Drops every in-flight transaction without journaling it. Used when
    /// the node stops; the transactions are recovered through
    /// synchronization.
    pub(crate) fn abandon_inflight(&self) -> usize {
        let mut abandoned = 0;
        for entry in self.resmgrs.entries() {
            for inflight in entry.drain_inflight() {
                inflight.cancel_monitor();
                let result = entry.rm.rollback(&inflight.context());
                if !result.is_success() {
                    debug!(resource = %entry.id, tx_id = %inflight.transaction.tx_id, %result, "discard failed");
                }
                abandoned += 1;
            }
        }
        abandoned
    }
}

impl MonitorTarget for Cluster {
    fn has_completed(&self, resource: &ResourceId, tx_id: TxId) -> bool {
        self.resmgrs
            .get(resource)
            .map_or(true, |entry| entry.has_completed(tx_id))
    }

    fn force_rollback(&self, resource: &ResourceId, tx_id: TxId) {
        let result = self.rollback_local(resource, tx_id);
        if !result.is_success() {
            warn!(%resource, %tx_id, %result, "forced rollback failed");
        }
    }

    fn mark_undetermined(&self, resource: &ResourceId, reason: &str) {
        if let Some(entry) = self.resmgrs.get(resource) {
            self.resmgrs.mark_undetermined(&entry, reason);
        }
    }

    fn is_shutting_down(&self) -> bool {
        !self.is_serving() || self.transport.is_shutting_down()
    }
}

/// Answers operations sent by other nodes.
pub(crate) struct NodeDispatcher {
    cluster: Weak<Cluster>,
}

impl NodeDispatcher {
    pub fn new(cluster: Weak<Cluster>) -> Self {
        Self { cluster }
    }
}

fn shutting_down() -> RemoteReply {
    RemoteReply::Refused(OpResult::failure(
        OpCode::ShuttingDown,
        "node is not started",
    ))
}

fn not_registered(resource: &ResourceId) -> RemoteReply {
    RemoteReply::Refused(OpResult::failure(
        OpCode::NotRegistered,
        format!("resource manager {resource} is not registered"),
    ))
}

impl crate::transport::RemoteHandler for NodeDispatcher {
    fn handle(&self, from: &NodeId, op: RemoteOp) -> RemoteReply {
        let Some(cluster) = self.cluster.upgrade() else {
            return shutting_down();
        };

        match op {
            RemoteOp::Identify => RemoteReply::Identity {
                node: cluster.local().clone(),
                cluster: cluster.config.cluster_name.clone(),
            },
            _ if !cluster.is_serving() => shutting_down(),
            RemoteOp::Protocol(op) => RemoteReply::Outcome(cluster.handle_protocol(&op)),
            RemoteOp::Discover { known } => {
                if cluster.nodes.is_registered(from) {
                    for (resource, tx_id) in &known {
                        cluster.resmgrs.record_update(resource, from, *tx_id);
                        if let Some(entry) = cluster.resmgrs.get(resource) {
                            cluster.fall_back_if_behind(&entry);
                        }
                    }
                }
                RemoteReply::Status {
                    last_tx: cluster.resmgrs.last_tx_map(),
                }
            }
            RemoteOp::FetchJournal {
                resource,
                after,
                up_to,
            } => {
                let Some(entry) = cluster.resmgrs.get(&resource) else {
                    return not_registered(&resource);
                };
                match entry.journal.entries_between(after, up_to) {
                    Ok(records) => {
                        debug!(%resource, %after, %up_to, count = records.len(), %from, "serving journal range");
                        RemoteReply::Journal { records }
                    }
                    Err(e) => RemoteReply::Refused(OpResult::resource_failure(format!(
                        "journal: {e}"
                    ))),
                }
            }
            RemoteOp::Resolve { resource, tx_ids } => {
                let Some(entry) = cluster.resmgrs.get(&resource) else {
                    return not_registered(&resource);
                };
                let mut records = Vec::new();
                for tx_id in &tx_ids {
                    match entry.journal.get(*tx_id) {
                        Ok(Some(record)) => records.push(record),
                        Ok(None) => {}
                        Err(e) => {
                            return RemoteReply::Refused(OpResult::resource_failure(format!(
                                "journal: {e}"
                            )))
                        }
                    }
                }
                let in_flight = tx_ids
                    .into_iter()
                    .filter(|tx_id| entry.is_inflight(*tx_id))
                    .collect();
                RemoteReply::Resolution { records, in_flight }
            }
        }
    }
}
