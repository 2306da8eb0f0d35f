//! Scriptable in-memory resource manager.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use txmesh_core::{ResourceManager, TxContext};
use txmesh_protocol::{JournalEntry, OpResult, ResourceId, Transaction, TxId};

/// One callback received by a [`ScriptedResourceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmCall {
    /// `start`
    Start(TxId),
    /// `prepare`
    Prepare(TxId),
    /// `commit`
    Commit(TxId),
    /// `rollback`
    Rollback(TxId),
    /// `replay`
    Replay(TxId),
    /// `post_sync`
    PostSync,
}

/// Resource manager that records every callback and fails on request.
///
/// Committed and replayed payloads end up in [`applied`](Self::applied),
/// in the order they were applied.
pub struct ScriptedResourceManager {
    id: ResourceId,
    calls: Mutex<Vec<RmCall>>,
    staged: Mutex<BTreeMap<TxId, Vec<u8>>>,
    applied: Mutex<Vec<(TxId, Vec<u8>)>>,
    fail_start: AtomicBool,
    fail_prepare: AtomicBool,
    fail_post_sync: AtomicBool,
    fail_replay: AtomicBool,
    prepare_delay: Mutex<Option<Duration>>,
    post_sync_runs: AtomicUsize,
}

impl ScriptedResourceManager {
    /// Creates a resource manager that accepts everything.
    pub fn new(id: impl Into<ResourceId>) -> Self {
        Self {
            id: id.into(),
            calls: Mutex::new(Vec::new()),
            staged: Mutex::new(BTreeMap::new()),
            applied: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            fail_prepare: AtomicBool::new(false),
            fail_post_sync: AtomicBool::new(false),
            fail_replay: AtomicBool::new(false),
            prepare_delay: Mutex::new(None),
            post_sync_runs: AtomicUsize::new(0),
        }
    }

    /// Makes `start` fail.
    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Makes `prepare` vote no.
    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Makes the post-sync hook fail.
    pub fn fail_post_sync(&self, fail: bool) {
        self.fail_post_sync.store(fail, Ordering::SeqCst);
    }

    /// Makes `replay` fail.
    pub fn fail_replay(&self, fail: bool) {
        self.fail_replay.store(fail, Ordering::SeqCst);
    }

    /// Makes `prepare` sleep after validating, before answering.
    pub fn delay_prepare(&self, delay: Option<Duration>) {
        *self.prepare_delay.lock() = delay;
    }

    /// Every callback so far, oldest first.
    pub fn calls(&self) -> Vec<RmCall> {
        self.calls.lock().clone()
    }

    /// Returns true if `call` was received.
    pub fn received(&self, call: RmCall) -> bool {
        self.calls.lock().contains(&call)
    }

    /// Payloads committed or replayed, in application order.
    pub fn applied(&self) -> Vec<(TxId, Vec<u8>)> {
        self.applied.lock().clone()
    }

    /// Transaction ids committed or replayed, in application order.
    pub fn applied_ids(&self) -> Vec<TxId> {
        self.applied.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Number of post-sync hook runs.
    pub fn post_sync_runs(&self) -> usize {
        self.post_sync_runs.load(Ordering::SeqCst)
    }

    /// Forgets the recorded callbacks.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: RmCall) {
        self.calls.lock().push(call);
    }
}

impl ResourceManager for ScriptedResourceManager {
    fn id(&self) -> ResourceId {
        self.id.clone()
    }

    fn start(&self, ctx: &TxContext, transaction: &Transaction) -> OpResult {
        self.record(RmCall::Start(ctx.tx_id()));
        if self.fail_start.load(Ordering::SeqCst) {
            return OpResult::resource_failure("scripted start failure");
        }
        self.staged
            .lock()
            .insert(ctx.tx_id(), transaction.payload.clone());
        OpResult::ok()
    }

    fn prepare(&self, ctx: &TxContext) -> OpResult {
        self.record(RmCall::Prepare(ctx.tx_id()));
        if !self.staged.lock().contains_key(&ctx.tx_id()) {
            return OpResult::resource_failure("nothing staged");
        }
        let delay = *self.prepare_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail_prepare.load(Ordering::SeqCst) {
            return OpResult::resource_failure("scripted prepare failure");
        }
        OpResult::ok()
    }

    fn commit(&self, ctx: &TxContext) -> OpResult {
        self.record(RmCall::Commit(ctx.tx_id()));
        match self.staged.lock().remove(&ctx.tx_id()) {
            Some(payload) => {
                self.applied.lock().push((ctx.tx_id(), payload));
                OpResult::ok()
            }
            None => OpResult::resource_failure("nothing staged"),
        }
    }

    fn rollback(&self, ctx: &TxContext) -> OpResult {
        self.record(RmCall::Rollback(ctx.tx_id()));
        self.staged.lock().remove(&ctx.tx_id());
        OpResult::ok()
    }

    fn replay(&self, entry: &JournalEntry) -> OpResult {
        self.record(RmCall::Replay(entry.tx_id));
        if self.fail_replay.load(Ordering::SeqCst) {
            return OpResult::resource_failure("scripted replay failure");
        }
        self.applied.lock().push((entry.tx_id, entry.payload.clone()));
        OpResult::ok()
    }

    fn post_sync(&self) -> OpResult {
        self.record(RmCall::PostSync);
        self.post_sync_runs.fetch_add(1, Ordering::SeqCst);
        if self.fail_post_sync.load(Ordering::SeqCst) {
            return OpResult::resource_failure("scripted post-sync failure");
        }
        OpResult::ok()
    }
}
