//! Transaction execution context.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use txmesh_protocol::{ResourceId, TaskId, TxId};

/// Token handed to resource manager callbacks while a transaction step runs.
///
/// Holding one proves the caller is on a transaction call path. Pass it to
/// [`crate::Manager::reentrant`] to call back into the coordinator without
/// taking the lifecycle lock, which the step's caller may already hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxContext {
    tx_id: TxId,
    resource: ResourceId,
    task_id: TaskId,
}

impl TxContext {
    pub(crate) fn new(tx_id: TxId, resource: ResourceId, task_id: TaskId) -> Self {
        Self {
            tx_id,
            resource,
            task_id,
        }
    }

    /// The transaction being executed.
    #[must_use]
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// The resource manager the transaction targets.
    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// The task that produced the transaction.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

/// Transaction steps currently inside a resource manager callback, keyed
/// by the thread running them.
///
/// Entered around every callback, whichever thread delivers the step: the
/// coordinator thread for local steps, a transport thread for remote ones.
#[derive(Debug, Default)]
pub(crate) struct ActiveSteps {
    steps: Mutex<HashMap<ThreadId, Vec<TxContext>>>,
}

impl ActiveSteps {
    /// Marks `ctx` active on the calling thread until the guard drops.
    pub fn enter(&self, ctx: &TxContext) -> StepGuard<'_> {
        let thread = thread::current().id();
        self.steps
            .lock()
            .entry(thread)
            .or_default()
            .push(ctx.clone());
        StepGuard {
            steps: self,
            thread,
        }
    }

    /// The innermost step running on the calling thread, if any.
    pub fn current(&self) -> Option<TxContext> {
        self.steps
            .lock()
            .get(&thread::current().id())
            .and_then(|stack| stack.last().cloned())
    }
}

/// Leaves a step entered with [`ActiveSteps::enter`].
pub(crate) struct StepGuard<'a> {
    steps: &'a ActiveSteps,
    thread: ThreadId,
}

impl Drop for StepGuard<'_> {
    fn drop(&mut self) {
        let mut steps = self.steps.steps.lock();
        if let Some(stack) = steps.get_mut(&self.thread) {
            stack.pop();
            if stack.is_empty() {
                steps.remove(&self.thread);
            }
        }
    }
}
