//! Initiator side of the two-phase commit.
//!
//! Requests are admitted through a counting gate, queued, and driven one
//! at a time by a single coordinator thread:
//!
//! 1. take a transaction id from the resource manager's shared counter
//! 2. freeze the participant set (every online node, this one included)
//! 3. `start` on all participants, `prepare` on all participants
//! 4. `commit` everywhere if every vote was yes within the transaction
//!    timeout, `rollback` everywhere otherwise

use crate::cluster::Cluster;
use crate::error::{ClusterError, ClusterResult};
use crate::transport::call_with_retry;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};
use txmesh_protocol::{
    Node, NodeId, OpCode, OpResult, ProtocolOp, RemoteOp, Request, TaskId, TaskStatus,
    Transaction, TxId,
};

pub(crate) const COORDINATOR_THREAD: &str = "txmesh-coordinator";

/// Counting semaphore bounding the number of admitted requests.
pub(crate) struct AdmissionGate {
    available: Mutex<usize>,
    cv: Condvar,
}

/// One admitted request's slot. Released on drop.
pub(crate) struct Permit {
    gate: Arc<AdmissionGate>,
}

impl AdmissionGate {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            available: Mutex::new(permits),
            cv: Condvar::new(),
        })
    }

    /// Waits for a free slot until `deadline`.
    pub fn acquire(self: &Arc<Self>, deadline: Instant) -> Option<Permit> {
        let mut available = self.available.lock();
        while *available == 0 {
            if self.cv.wait_until(&mut available, deadline).timed_out() && *available == 0 {
                return None;
            }
        }
        *available -= 1;
        Some(Permit {
            gate: Arc::clone(self),
        })
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        *self.gate.available.lock() += 1;
        self.gate.cv.notify_one();
    }
}

pub(crate) struct Queued {
    pub request: Request,
    _permit: Permit,
}

struct Running {
    task_id: TaskId,
    cancelled: Arc<AtomicBool>,
}

struct QueueState {
    items: VecDeque<Queued>,
    open: bool,
    running: Option<Running>,
}

/// Bounded FIFO between submitters and the coordinator thread.
pub(crate) struct RequestQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl RequestQueue {
    /// Creates a closed queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                open: false,
                running: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn open(&self) {
        self.state.lock().open = true;
    }

    /// Closes the queue and returns what was still waiting in it.
    pub fn close(&self) -> Vec<Queued> {
        let drained = {
            let mut state = self.state.lock();
            state.open = false;
            state.items.drain(..).collect()
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        drained
    }

    /// Appends a request, waiting for room until `deadline`.
    pub fn push(&self, item: Queued, deadline: Instant) -> ClusterResult<()> {
        let mut state = self.state.lock();
        loop {
            if !state.open {
                return Err(ClusterError::SubmitInterrupted);
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            if self.not_full.wait_until(&mut state, deadline).timed_out()
                && state.open
                && state.items.len() >= self.capacity
            {
                return Err(ClusterError::SubmitTimeout);
            }
        }
    }

    /// Takes the next request and marks it running. Blocks while the queue
    /// is open and empty; returns `None` once closed.
    fn pop(&self) -> Option<(Queued, Arc<AtomicBool>)> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                let cancelled = Arc::new(AtomicBool::new(false));
                state.running = Some(Running {
                    task_id: item.request.task_id,
                    cancelled: Arc::clone(&cancelled),
                });
                self.not_full.notify_one();
                return Some((item, cancelled));
            }
            if !state.open {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    fn finish(&self) {
        self.state.lock().running = None;
    }

    /// Removes a queued request, or flags the running one as cancelled.
    pub fn cancel(&self, task_id: TaskId) -> Cancellation {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .items
            .iter()
            .position(|item| item.request.task_id == task_id)
        {
            state.items.remove(pos);
            self.not_full.notify_one();
            return Cancellation::Dequeued;
        }
        match &state.running {
            Some(running) if running.task_id == task_id => {
                running.cancelled.store(true, Ordering::SeqCst);
                Cancellation::Flagged
            }
            _ => Cancellation::NotFound,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn peek(&self) -> Option<Request> {
        self.state
            .lock()
            .items
            .front()
            .map(|item| item.request.clone())
    }

    pub fn pending(&self) -> Vec<Request> {
        self.state
            .lock()
            .items
            .iter()
            .map(|item| item.request.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cancellation {
    Dequeued,
    Flagged,
    NotFound,
}

/// Admission, queueing and the coordinator thread.
pub(crate) struct Coordinator {
    cluster: Arc<Cluster>,
    queue: Arc<RequestQueue>,
    gate: Arc<AdmissionGate>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        let queue = Arc::new(RequestQueue::new(cluster.config.queue_capacity));
        let gate = AdmissionGate::new(cluster.config.admission_permits);
        Self {
            cluster,
            queue,
            gate,
            worker: Mutex::new(None),
        }
    }

    /// Opens the queue and spawns the coordinator thread.
    pub fn start(&self) -> ClusterResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.queue.open();

        let cluster = Arc::clone(&self.cluster);
        let queue = Arc::clone(&self.queue);
        let handle = thread::Builder::new()
            .name(COORDINATOR_THREAD.to_string())
            .spawn(move || {
                while let Some((item, cancelled)) = queue.pop() {
                    cluster.drive(&item.request, &cancelled);
                    queue.finish();
                }
                debug!("coordinator thread stopped");
            })
            .map_err(|_| {
                self.queue.close();
                ClusterError::Spawn("coordinator")
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Closes the queue, marks what was still waiting `UNKNOWN` and waits
    /// for the running request to finish.
    pub fn stop(&self) {
        let drained = self.queue.close();
        for item in drained {
            self.cluster.tasks.update(
                item.request.task_id,
                TaskStatus::Unknown,
                Some("coordinator stopped".to_string()),
            );
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("coordinator thread panicked");
            }
        }
    }

    /// Admits and queues a request. Returns its task id.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::NotStarted`] if the node is not serving
    /// - [`ClusterError::QuorumNotOnline`] without quorum; nothing is queued
    /// - [`ClusterError::SubmitTimeout`] if no slot frees up in time
    /// - [`ClusterError::SubmitInterrupted`] if the queue closes meanwhile
    pub fn submit(&self, request: Request) -> ClusterResult<TaskId> {
        if !self.cluster.is_serving() {
            return Err(ClusterError::NotStarted);
        }
        if !self.cluster.nodes.is_quorum_online() {
            return Err(ClusterError::QuorumNotOnline);
        }

        let deadline = Instant::now() + self.cluster.config.submit_timeout;
        let permit = self
            .gate
            .acquire(deadline)
            .ok_or(ClusterError::SubmitTimeout)?;

        let task_id = request.task_id;
        self.cluster.tasks.insert(&request);
        let queued = Queued {
            request,
            _permit: permit,
        };
        if let Err(e) = self.queue.push(queued, deadline) {
            self.cluster
                .tasks
                .update(task_id, TaskStatus::RolledBack, Some(e.to_string()));
            return Err(e);
        }
        debug!(task = %task_id, pending = self.queue.len(), "request queued");
        Ok(task_id)
    }

    /// Cancels a queued or running task. Returns false if the task is
    /// neither.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.queue.cancel(task_id) {
            Cancellation::Dequeued => {
                self.cluster.tasks.update(
                    task_id,
                    TaskStatus::RolledBack,
                    Some("cancelled".to_string()),
                );
                info!(task = %task_id, "queued task cancelled");
                true
            }
            Cancellation::Flagged => {
                info!(task = %task_id, "running task flagged for cancellation");
                true
            }
            Cancellation::NotFound => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn peek_pending(&self) -> Option<Request> {
        self.queue.peek()
    }

    pub fn pending(&self) -> Vec<Request> {
        self.queue.pending()
    }

    pub fn available_permits(&self) -> usize {
        self.gate.available()
    }
}

impl Cluster {
    /// Runs one request through the two-phase commit.
    pub(crate) fn drive(&self, request: &Request, cancelled: &AtomicBool) {
        let task_id = request.task_id;
        let resource = &request.resource;

        if self.resmgrs.get(resource).is_none() {
            self.tasks.update(
                task_id,
                TaskStatus::RolledBack,
                Some(format!("resource manager {resource} is not registered")),
            );
            return;
        }
        if cancelled.load(Ordering::SeqCst) {
            self.tasks
                .update(task_id, TaskStatus::RolledBack, Some("cancelled".to_string()));
            return;
        }

        let participants = self.nodes.online_peers();
        let tx_id = match self.tx_counter(resource).increment_and_get() {
            Ok(value) => TxId::new(value),
            Err(e) => {
                warn!(task = %task_id, %resource, error = %e, "no transaction id");
                self.tasks.update(
                    task_id,
                    TaskStatus::RolledBack,
                    Some(format!("transaction id unavailable: {e}")),
                );
                return;
            }
        };
        self.tasks.assign(task_id, tx_id);
        info!(
            task = %task_id,
            %resource,
            %tx_id,
            participants = participants.len(),
            "transaction started"
        );

        let transaction =
            Transaction::from_request(request, tx_id, self.local().id.clone(), participants.clone());
        let began = Instant::now();
        let started = self.fan_out(&participants, &ProtocolOp::Start { transaction });
        if let Some(failure) = first_failure(&started) {
            self.abort(request, tx_id, &participants, failure);
            return;
        }
        self.tasks.update(task_id, TaskStatus::Started, None);

        if cancelled.load(Ordering::SeqCst) {
            self.abort(request, tx_id, &participants, "cancelled".to_string());
            return;
        }
        let votes = self.fan_out(
            &participants,
            &ProtocolOp::Prepare {
                resource: resource.clone(),
                tx_id,
            },
        );
        if let Some(failure) = first_failure(&votes) {
            self.abort(request, tx_id, &participants, failure);
            return;
        }
        if cancelled.load(Ordering::SeqCst) {
            self.abort(request, tx_id, &participants, "cancelled".to_string());
            return;
        }
        // Participant monitors may already be rolling back
        if began.elapsed() >= self.config.tx_timeout {
            self.abort(request, tx_id, &participants, "votes arrived after the transaction timeout".to_string());
            return;
        }
        self.tasks.update(task_id, TaskStatus::Prepared, None);

        let commits = self.fan_out(
            &participants,
            &ProtocolOp::Commit {
                resource: resource.clone(),
                tx_id,
            },
        );
        for (node, result) in commits.iter().filter(|(_, r)| !r.is_success()) {
            warn!(task = %task_id, %tx_id, peer = %node, %result, "commit failed on participant");
        }
        self.tasks.update(task_id, TaskStatus::Committed, None);
        info!(task = %task_id, %resource, %tx_id, "transaction committed");
    }

    fn abort(&self, request: &Request, tx_id: TxId, participants: &[Node], reason: String) {
        let rollbacks = self.fan_out(
            participants,
            &ProtocolOp::Rollback {
                resource: request.resource.clone(),
                tx_id,
            },
        );
        for (node, result) in rollbacks.iter().filter(|(_, r)| !r.is_success()) {
            debug!(%tx_id, peer = %node, %result, "rollback failed on participant");
        }
        info!(task = %request.task_id, resource = %request.resource, %tx_id, %reason, "transaction rolled back");
        self.tasks
            .update(request.task_id, TaskStatus::RolledBack, Some(reason));
    }

    /// Sends one protocol step to every participant in parallel.
    fn fan_out(&self, participants: &[Node], op: &ProtocolOp) -> Vec<(NodeId, OpResult)> {
        let local = &self.local().id;
        let remote = RemoteOp::Protocol(op.clone());

        thread::scope(|scope| {
            let calls: Vec<_> = participants
                .iter()
                .filter(|node| &node.id != local)
                .map(|node| {
                    let remote = &remote;
                    let call = scope.spawn(move || {
                        match call_with_retry(
                            self.transport.as_ref(),
                            node,
                            remote,
                            self.config.call_timeout,
                            &self.config.retry,
                        ) {
                            Ok(reply) => reply.into_outcome(),
                            Err(e) => OpResult::failure(OpCode::Transport, e.to_string()),
                        }
                    });
                    (node.id.clone(), call)
                })
                .collect();

            // Local callbacks stay on the coordinator thread.
            let mut results = Vec::with_capacity(participants.len());
            if participants.iter().any(|node| &node.id == local) {
                results.push((local.clone(), self.handle_protocol(op)));
            }

            for (id, call) in calls {
                let result = call
                    .join()
                    .unwrap_or_else(|_| OpResult::resource_failure("participant call panicked"));
                results.push((id, result));
            }
            results
        })
    }
}

fn first_failure(results: &[(NodeId, OpResult)]) -> Option<String> {
    results
        .iter()
        .find(|(_, result)| !result.is_success())
        .map(|(node, result)| format!("{node}: {result}"))
}
