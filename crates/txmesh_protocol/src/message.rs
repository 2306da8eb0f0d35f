//! Remote operations and their replies.

use crate::ids::{ResourceId, TxId};
use crate::journal::JournalRecord;
use crate::node::Node;
use crate::request::Transaction;
use crate::result::OpResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The four two-phase-commit steps executed on each participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolOp {
    /// Hand the payload and the frozen participant set to the resource manager.
    Start {
        /// The transaction to start.
        transaction: Transaction,
    },
    /// Ask the resource manager to validate and stage the effect.
    Prepare {
        /// Target resource manager.
        resource: ResourceId,
        /// Transaction id.
        tx_id: TxId,
    },
    /// Make the staged effect durable.
    Commit {
        /// Target resource manager.
        resource: ResourceId,
        /// Transaction id.
        tx_id: TxId,
    },
    /// Discard the staged effect.
    Rollback {
        /// Target resource manager.
        resource: ResourceId,
        /// Transaction id.
        tx_id: TxId,
    },
}

impl ProtocolOp {
    /// Returns the step name, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::Start { .. } => "start",
            ProtocolOp::Prepare { .. } => "prepare",
            ProtocolOp::Commit { .. } => "commit",
            ProtocolOp::Rollback { .. } => "rollback",
        }
    }

    /// Returns the target resource manager.
    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        match self {
            ProtocolOp::Start { transaction } => &transaction.resource,
            ProtocolOp::Prepare { resource, .. }
            | ProtocolOp::Commit { resource, .. }
            | ProtocolOp::Rollback { resource, .. } => resource,
        }
    }

    /// Returns the transaction id.
    #[must_use]
    pub fn tx_id(&self) -> TxId {
        match self {
            ProtocolOp::Start { transaction } => transaction.tx_id,
            ProtocolOp::Prepare { tx_id, .. }
            | ProtocolOp::Commit { tx_id, .. }
            | ProtocolOp::Rollback { tx_id, .. } => *tx_id,
        }
    }
}

/// Any operation one node can execute on another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteOp {
    /// Ask the node who it is.
    Identify,
    /// A two-phase-commit step.
    Protocol(ProtocolOp),
    /// Ask for the node's highest journaled transaction id per resource
    /// manager.
    Discover {
        /// The caller's own last known ids.
        known: BTreeMap<ResourceId, TxId>,
    },
    /// Ask for the journal records in `(after, up_to]`.
    FetchJournal {
        /// Resource manager whose journal is read.
        resource: ResourceId,
        /// Exclusive lower bound.
        after: TxId,
        /// Inclusive upper bound.
        up_to: TxId,
    },
    /// Ask what the node knows about transaction ids missing from the
    /// caller's journal.
    Resolve {
        /// Resource manager the ids belong to.
        resource: ResourceId,
        /// The missing ids.
        tx_ids: Vec<TxId>,
    },
}

impl RemoteOp {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            RemoteOp::Identify => 1,
            RemoteOp::Protocol(_) => 2,
            RemoteOp::Discover { .. } => 3,
            RemoteOp::FetchJournal { .. } => 4,
            RemoteOp::Resolve { .. } => 5,
        }
    }
}

/// Reply to a [`RemoteOp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteReply {
    /// Answer to `Identify`.
    Identity {
        /// The answering node.
        node: Node,
        /// Cluster the node belongs to.
        cluster: String,
    },
    /// Result of a protocol step.
    Outcome(OpResult),
    /// Highest journaled transaction id per resource manager.
    Status {
        /// Resource id to highest journaled transaction id.
        last_tx: BTreeMap<ResourceId, TxId>,
    },
    /// Journal records in transaction id order.
    Journal {
        /// The records.
        records: Vec<JournalRecord>,
    },
    /// Answer to `Resolve`.
    Resolution {
        /// Records the node holds for the asked ids.
        records: Vec<JournalRecord>,
        /// Asked ids still in flight on the node.
        in_flight: Vec<TxId>,
    },
    /// The node refused the operation.
    Refused(OpResult),
}

impl RemoteReply {
    /// Collapses any reply into an [`OpResult`] for protocol steps.
    #[must_use]
    pub fn into_outcome(self) -> OpResult {
        match self {
            RemoteReply::Outcome(result) | RemoteReply::Refused(result) => result,
            other => OpResult::resource_failure(format!("unexpected reply: {other:?}")),
        }
    }
}
