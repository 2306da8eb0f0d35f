//! Transaction monitor (watchdog).
//!
//! One monitor is armed per transaction on every participant when `start`
//! reaches the resource manager. It sleeps in slices of a tenth of the
//! timeout and exits as soon as one of these holds:
//!
//! - it was cancelled (the transaction completed locally)
//! - the shared counter moved past the transaction id
//! - the deadline elapsed, in which case it rolls back locally and pushes
//!   the counter to at least the transaction id
//! - the transport is shutting down

use crate::error::{ClusterError, ClusterResult};
use crate::transport::DistributedCounter;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use txmesh_protocol::{ResourceId, TxId};

const MIN_POLL: Duration = Duration::from_millis(1);

/// What a monitor acts upon.
pub(crate) trait MonitorTarget: Send + Sync {
    /// Returns true once the transaction is journaled locally.
    fn has_completed(&self, resource: &ResourceId, tx_id: TxId) -> bool;

    /// Rolls the transaction back locally.
    fn force_rollback(&self, resource: &ResourceId, tx_id: TxId);

    /// Forces the resource manager back to `UNDETERMINED`.
    fn mark_undetermined(&self, resource: &ResourceId, reason: &str);

    /// Returns true while the runtime is being torn down.
    fn is_shutting_down(&self) -> bool;
}

#[derive(Default)]
struct Signal {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

/// Cancels an armed monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    signal: Arc<Signal>,
}

impl MonitorHandle {
    /// Stops the monitor without it acting.
    pub fn cancel(&self) {
        let mut cancelled = self.signal.cancelled.lock();
        *cancelled = true;
        self.signal.cv.notify_all();
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.signal.cancelled.lock()
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// How a monitor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorExit {
    Cancelled,
    Completed,
    Overtaken,
    TimedOut,
    ShuttingDown,
}

pub(crate) struct TransactionMonitor {
    pub resource: ResourceId,
    pub tx_id: TxId,
    pub timeout: Duration,
    pub participants: usize,
}

impl TransactionMonitor {
    /// Starts the monitor on its own thread.
    pub fn arm(
        self,
        counter: Arc<dyn DistributedCounter>,
        target: Weak<dyn MonitorTarget>,
    ) -> ClusterResult<MonitorHandle> {
        let handle = MonitorHandle {
            signal: Arc::new(Signal::default()),
        };
        let signal = Arc::clone(&handle.signal);

        thread::Builder::new()
            .name(format!("txmesh-monitor-{}", self.tx_id.as_i64()))
            .spawn(move || {
                let exit = self.run(&signal, counter.as_ref(), &target);
                debug!(
                    resource = %self.resource,
                    tx_id = %self.tx_id,
                    ?exit,
                    "transaction monitor finished"
                );
            })
            .map_err(|_| ClusterError::Spawn("transaction monitor"))?;

        Ok(handle)
    }

    fn run(
        &self,
        signal: &Signal,
        counter: &dyn DistributedCounter,
        target: &Weak<dyn MonitorTarget>,
    ) -> MonitorExit {
        let deadline = Instant::now() + self.timeout;
        let poll = (self.timeout / 10).max(MIN_POLL);

        loop {
            {
                let mut cancelled = signal.cancelled.lock();
                if !*cancelled {
                    signal.cv.wait_for(&mut cancelled, poll);
                }
                if *cancelled {
                    return MonitorExit::Cancelled;
                }
            }

            let Some(target) = target.upgrade() else {
                return MonitorExit::ShuttingDown;
            };
            if target.is_shutting_down() {
                return MonitorExit::ShuttingDown;
            }
            if target.has_completed(&self.resource, self.tx_id) {
                return MonitorExit::Completed;
            }

            match counter.get() {
                Ok(current) if current > self.tx_id.as_i64() => {
                    // Resolved elsewhere, but never seen here
                    if !target.has_completed(&self.resource, self.tx_id) {
                        warn!(
                            resource = %self.resource,
                            tx_id = %self.tx_id,
                            current,
                            "transaction overtaken before local completion"
                        );
                        target.mark_undetermined(&self.resource, "missed transaction completion");
                    }
                    return MonitorExit::Overtaken;
                }
                Ok(_) => {}
                Err(e) => debug!(tx_id = %self.tx_id, error = %e, "counter read failed"),
            }

            if Instant::now() >= deadline {
                warn!(
                    resource = %self.resource,
                    tx_id = %self.tx_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    participants = self.participants,
                    "transaction timed out, rolling back locally"
                );
                target.force_rollback(&self.resource, self.tx_id);
                if let Err(e) = counter.fetch_max(self.tx_id.as_i64()) {
                    warn!(tx_id = %self.tx_id, error = %e, "could not advance transaction counter");
                }
                return MonitorExit::TimedOut;
            }
        }
    }
}
