//! Error types for the coordinator.

use crate::status::{ClusterStatus, SyncState};
use thiserror::Error;
use txmesh_protocol::{ResourceId, TxId};

/// Result type for coordinator operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised synchronously by coordinator entry points.
///
/// Remote protocol steps never surface these; they report an
/// [`txmesh_protocol::OpResult`] instead.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Invalid or unusable configuration. Fatal, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The transport substrate failed.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Fewer than a strict majority of registered peers are online.
    #[error("quorum not online")]
    QuorumNotOnline,

    /// The coordinator is not started.
    #[error("coordinator not started")]
    NotStarted,

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} while {status}")]
    InvalidStatus {
        /// Attempted operation.
        operation: &'static str,
        /// Current lifecycle state.
        status: ClusterStatus,
    },

    /// The resource manager is not `UP_TO_DATE`.
    #[error("resource manager {resource} is not ready ({state})")]
    NotReady {
        /// Resource manager id.
        resource: ResourceId,
        /// Its current state.
        state: SyncState,
    },

    /// `stop` was called from inside an active transaction.
    #[error("stop called from within an active transaction")]
    StopWithinTransaction,

    /// The admission gate or the queue stayed full past the submit timeout.
    #[error("submission timed out")]
    SubmitTimeout,

    /// The queue was closed while the submission waited.
    #[error("submission interrupted by shutdown")]
    SubmitInterrupted,

    /// Replay returned a different number of records than requested.
    #[error("journal gap for {resource}: expected {expected} records, got {actual}")]
    JournalGap {
        /// Resource manager id.
        resource: ResourceId,
        /// Records expected in the range.
        expected: u64,
        /// Records received.
        actual: u64,
    },

    /// A resource manager failed to replay a journal entry.
    #[error("replay of {tx_id} on {resource} failed: {message}")]
    ReplayFailed {
        /// Resource manager id.
        resource: ResourceId,
        /// Transaction being replayed.
        tx_id: TxId,
        /// Failure description.
        message: String,
    },

    /// Invalid synchronization state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: SyncState,
        /// Attempted target state.
        to: SyncState,
    },

    /// No resource manager is registered under this id.
    #[error("unknown resource manager: {0}")]
    UnknownResource(ResourceId),

    /// A resource manager or peer with this id is already registered.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// A peer registration was refused.
    #[error("peer rejected: {0}")]
    PeerRejected(String),

    /// A background thread could not be spawned.
    #[error("failed to spawn {0} thread")]
    Spawn(&'static str),

    /// Journal failure.
    #[error("journal error: {0}")]
    Journal(#[from] txmesh_journal::JournalError),

    /// Protocol value could not be built or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] txmesh_protocol::ProtocolError),
}

impl ClusterError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    /// Creates an invalid-status error.
    pub fn invalid_status(operation: &'static str, status: ClusterStatus) -> Self {
        Self::InvalidStatus { operation, status }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::Transport { retryable, .. } => *retryable,
            ClusterError::QuorumNotOnline
            | ClusterError::SubmitTimeout
            | ClusterError::NotReady { .. } => true,
            _ => false,
        }
    }
}
