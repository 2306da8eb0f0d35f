//! Journal records as exchanged between nodes during synchronization.

use crate::ids::{ResourceId, TaskId, TxId};
use serde::{Deserialize, Serialize};

/// The effect of one committed transaction on one resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Transaction id.
    pub tx_id: TxId,
    /// Resource manager the entry belongs to.
    pub resource: ResourceId,
    /// Task that produced the transaction.
    pub task_id: TaskId,
    /// Opaque payload, replayable independently of other entries.
    pub payload: Vec<u8>,
}

/// One journal record. Every transaction id of a resource manager ends up
/// as exactly one record, committed or rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A committed transaction.
    Committed(JournalEntry),
    /// A rolled back transaction. Replays as a no-op.
    RolledBack {
        /// Transaction id.
        tx_id: TxId,
        /// Task that produced the transaction.
        task_id: TaskId,
    },
}

impl JournalRecord {
    /// Returns the transaction id of the record.
    #[must_use]
    pub fn tx_id(&self) -> TxId {
        match self {
            JournalRecord::Committed(entry) => entry.tx_id,
            JournalRecord::RolledBack { tx_id, .. } => *tx_id,
        }
    }

    /// Returns the task id of the record.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        match self {
            JournalRecord::Committed(entry) => entry.task_id,
            JournalRecord::RolledBack { task_id, .. } => *task_id,
        }
    }

    /// Returns true for committed records.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, JournalRecord::Committed(_))
    }
}
