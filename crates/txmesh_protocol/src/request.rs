//! Client requests and the transactions built from them.

use crate::ids::{ResourceId, TaskId, TxId};
use crate::node::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Queued, no transaction id assigned yet.
    Pending,
    /// `start` succeeded on every participant.
    Started,
    /// Every participant voted to commit.
    Prepared,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
    /// Outcome cannot be determined.
    Unknown,
}

impl TaskStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, TaskStatus::Committed | TaskStatus::RolledBack)
    }

    /// Returns true if a task may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Started | RolledBack | Unknown) => true,
            (Started, Prepared | RolledBack | Unknown) => true,
            (Prepared, Committed | RolledBack | Unknown) => true,
            (Unknown, Committed | RolledBack) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Prepared => "PREPARED",
            TaskStatus::Committed => "COMMITTED",
            TaskStatus::RolledBack => "ROLLED_BACK",
            TaskStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A queued client request, before a transaction id is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Target resource manager.
    pub resource: ResourceId,
    /// Client-visible task id.
    pub task_id: TaskId,
    /// Opaque payload handed to the resource manager.
    pub payload: Vec<u8>,
    /// Current task status.
    pub status: TaskStatus,
}

impl Request {
    /// Creates a pending request with a fresh task id.
    #[must_use]
    pub fn new(resource: ResourceId, payload: Vec<u8>) -> Self {
        Self {
            resource,
            task_id: TaskId::generate(),
            payload,
            status: TaskStatus::Pending,
        }
    }
}

/// A request turned into a transaction with a frozen participant set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Assigned transaction id.
    pub tx_id: TxId,
    /// Target resource manager.
    pub resource: ResourceId,
    /// Client-visible task id.
    pub task_id: TaskId,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Node that initiated the transaction.
    pub initiator: NodeId,
    /// Participant set frozen when the transaction started.
    pub participants: Vec<Node>,
}

impl Transaction {
    /// Builds a transaction from a dequeued request.
    #[must_use]
    pub fn from_request(
        request: &Request,
        tx_id: TxId,
        initiator: NodeId,
        participants: Vec<Node>,
    ) -> Self {
        Self {
            tx_id,
            resource: request.resource.clone(),
            task_id: request.task_id,
            payload: request.payload.clone(),
            initiator,
            participants,
        }
    }

    /// Returns true if `node` is in the frozen participant set.
    #[must_use]
    pub fn is_participant(&self, node: &NodeId) -> bool {
        self.participants.iter().any(|p| &p.id == node)
    }
}
