//! Transport substrate abstraction.
//!
//! The coordinator does not ship a network layer. It needs a group
//! membership view, point-to-point calls with a timeout, and named
//! cluster-wide atomic counters; any substrate offering those can drive it.

use crate::config::RetryConfig;
use crate::error::ClusterError;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use txmesh_protocol::{Node, NodeId, RemoteOp, RemoteReply};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Transport failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The target node cannot be reached.
    #[error("node {0} unreachable")]
    Unreachable(NodeId),

    /// The call did not complete in time.
    #[error("call to {node} timed out after {timeout_ms} ms")]
    Timeout {
        /// Target node.
        node: NodeId,
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The transport is not connected.
    #[error("transport not connected")]
    NotConnected,

    /// The transport is shutting down.
    #[error("transport shutting down")]
    ShuttingDown,

    /// Message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Returns true if the call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Timeout { .. }
        )
    }
}

impl From<TransportError> for ClusterError {
    fn from(err: TransportError) -> Self {
        let retryable = err.is_retryable();
        ClusterError::transport(err.to_string(), retryable)
    }
}

/// A named cluster-wide atomic counter.
pub trait DistributedCounter: Send + Sync {
    /// Returns the current value.
    fn get(&self) -> TransportResult<i64>;

    /// Increments and returns the new value.
    fn increment_and_get(&self) -> TransportResult<i64>;

    /// Raises the value to at least `value`, never lowering it.
    /// Returns the value after the merge.
    fn fetch_max(&self, value: i64) -> TransportResult<i64>;
}

/// Executes remote operations addressed to this node.
pub trait RemoteHandler: Send + Sync {
    /// Handles one operation from `from`.
    fn handle(&self, from: &NodeId, op: RemoteOp) -> RemoteReply;
}

/// Receives group membership changes.
///
/// Callbacks may arrive on any thread and must not block for long.
pub trait MembershipListener: Send + Sync {
    /// A member joined the group. Its identity is not yet confirmed.
    fn member_joined(&self, node: Node);

    /// A member left the group.
    fn member_left(&self, node: &NodeId);
}

/// The group membership and RPC substrate.
pub trait ClusterTransport: Send + Sync {
    /// The node this transport runs on.
    fn local_node(&self) -> Node;

    /// Joins the cluster. `handler` serves incoming calls, `membership`
    /// receives join/leave notifications.
    fn connect(
        &self,
        cluster_name: &str,
        secret: Option<&str>,
        handler: Arc<dyn RemoteHandler>,
        membership: Arc<dyn MembershipListener>,
    ) -> TransportResult<()>;

    /// Leaves the cluster.
    fn disconnect(&self);

    /// Returns true while the transport is tearing down.
    fn is_shutting_down(&self) -> bool;

    /// Current group members, the local node included.
    fn members(&self) -> Vec<Node>;

    /// Executes `op` on `target` and waits at most `timeout` for the reply.
    fn call(&self, target: &Node, op: &RemoteOp, timeout: Duration)
        -> TransportResult<RemoteReply>;

    /// Returns the cluster-wide counter called `name`.
    fn counter(&self, name: &str) -> Arc<dyn DistributedCounter>;
}

/// Calls `target`, retrying retryable failures per `retry`.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, or the first
/// non-retryable error.
pub fn call_with_retry(
    transport: &dyn ClusterTransport,
    target: &Node,
    op: &RemoteOp,
    timeout: Duration,
    retry: &RetryConfig,
) -> TransportResult<RemoteReply> {
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        match transport.call(target, op, timeout) {
            Ok(reply) => return Ok(reply),
            Err(e) if e.is_retryable() && attempt + 1 < attempts && !transport.is_shutting_down() => {
                debug!(node = %target.id, attempt, error = %e, "retrying remote call");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A process-local [`DistributedCounter`].
///
/// Enough for a single-node cluster; in-process test networks share one
/// instance between all their nodes.
#[derive(Debug)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    /// Creates a counter with an initial value.
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(-1)
    }
}

impl DistributedCounter for AtomicCounter {
    fn get(&self) -> TransportResult<i64> {
        Ok(self.value.load(Ordering::SeqCst))
    }

    fn increment_and_get(&self) -> TransportResult<i64> {
        Ok(self.value.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn fetch_max(&self, value: i64) -> TransportResult<i64> {
        Ok(self.value.fetch_max(value, Ordering::SeqCst).max(value))
    }
}
