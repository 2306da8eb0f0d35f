//! The per-resource-manager journal.

use crate::backend::JournalBackend;
use crate::error::{JournalError, JournalResult};
use crate::file::FileStore;
use crate::iterator::JournalIterator;
use crate::memory::MemoryStore;
use crate::record::encode_frame;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use txmesh_protocol::{JournalRecord, TaskId, TxId};

/// Summary produced by [`Journal::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalReport {
    /// Total number of records.
    pub records: u64,
    /// Number of committed records.
    pub committed: u64,
    /// Number of rolled back records.
    pub rolled_back: u64,
    /// Lowest transaction id present.
    pub first_tx: Option<TxId>,
    /// Highest transaction id present.
    pub last_tx: Option<TxId>,
    /// Journal size in bytes.
    pub bytes: u64,
    /// Transaction ids missing between `first_tx` and `last_tx`.
    pub gaps: u64,
}

#[derive(Debug, Default)]
struct Index {
    /// Transaction id -> frame offset.
    offsets: BTreeMap<TxId, u64>,
    /// Highest id such that every id from `0` up to it is journaled.
    contiguous: TxId,
}

impl Index {
    fn insert(&mut self, tx_id: TxId, offset: u64) -> bool {
        if self.offsets.insert(tx_id, offset).is_some() {
            return false;
        }
        while self.offsets.contains_key(&self.contiguous.next()) {
            self.contiguous = self.contiguous.next();
        }
        true
    }
}

/// Append-only journal of one resource manager.
///
/// Records are appended in completion order but indexed by transaction id,
/// so range reads always come back in transaction id order. A transaction
/// id is journaled at most once.
pub struct Journal {
    backend: Mutex<Box<dyn JournalBackend>>,
    path: Option<PathBuf>,
    index: RwLock<Index>,
    running: AtomicBool,
}

impl Journal {
    /// Opens a journal over `backend`, rebuilding the index.
    ///
    /// A torn trailing frame is cut off; any other damage aborts the open.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or I/O failure.
    pub fn open(backend: Box<dyn JournalBackend>, path: Option<PathBuf>) -> JournalResult<Self> {
        let journal = Self {
            backend: Mutex::new(backend),
            path,
            index: RwLock::new(Index::default()),
            running: AtomicBool::new(true),
        };
        journal.rebuild_index()?;
        Ok(journal)
    }

    /// Opens or creates a file-backed journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is corrupted.
    pub fn open_file(path: &Path) -> JournalResult<Self> {
        let backend = FileStore::open(path)?;
        Self::open(Box::new(backend), Some(path.to_path_buf()))
    }

    /// Creates an empty in-memory journal.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Box::new(MemoryStore::new())),
            path: None,
            index: RwLock::new(Index::default()),
            running: AtomicBool::new(true),
        }
    }

    fn rebuild_index(&self) -> JournalResult<()> {
        let mut index = Index::default();
        let valid_end = {
            let mut iter = self.iter()?;
            for item in iter.by_ref() {
                let (offset, record) = item?;
                if !index.insert(record.tx_id(), offset) {
                    return Err(JournalError::corruption(format!(
                        "{} journaled twice",
                        record.tx_id()
                    )));
                }
            }
            iter.valid_end()
        };
        let size = self.backend.lock().size()?;

        if valid_end < size {
            warn!(
                journal = ?self.path,
                valid_end,
                size,
                "discarding torn record at journal tail"
            );
            self.backend.lock().truncate(valid_end)?;
        }

        debug!(
            journal = ?self.path,
            records = index.offsets.len(),
            last_tx = %index.contiguous,
            "journal opened"
        );
        *self.index.write() = index;
        Ok(())
    }

    /// Appends a record and flushes it.
    ///
    /// Returns `Ok(false)` without writing if the transaction id is already
    /// journaled, so replaying the same record twice is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is closed or the write fails.
    pub fn append(&self, record: &JournalRecord) -> JournalResult<bool> {
        if !self.is_running() {
            return Err(JournalError::Closed);
        }

        let tx_id = record.tx_id();
        let frame = encode_frame(record)?;

        // Index lock first, so concurrent appends of the same id cannot both write.
        let mut index = self.index.write();
        if index.offsets.contains_key(&tx_id) {
            return Ok(false);
        }

        let offset = {
            let mut backend = self.backend.lock();
            let offset = backend.append(&frame)?;
            backend.flush()?;
            offset
        };
        index.insert(tx_id, offset);

        Ok(true)
    }

    /// Last completed transaction id: the highest id such that every id
    /// from `0` up to it is journaled, or [`TxId::NONE`].
    ///
    /// Ids journaled beyond a hole do not count until the hole is filled,
    /// so a replay range starting here never skips a transaction.
    #[must_use]
    pub fn last_tx_id(&self) -> TxId {
        self.index.read().contiguous
    }

    /// Highest journaled transaction id, or [`TxId::NONE`].
    #[must_use]
    pub fn max_tx_id(&self) -> TxId {
        self.index
            .read()
            .offsets
            .keys()
            .next_back()
            .copied()
            .unwrap_or(TxId::NONE)
    }

    /// Ids below [`Journal::max_tx_id`] that are not journaled, lowest
    /// first, at most `limit` of them.
    #[must_use]
    pub fn holes(&self, limit: usize) -> Vec<TxId> {
        let index = self.index.read();
        let Some(max) = index.offsets.keys().next_back().copied() else {
            return Vec::new();
        };
        let mut holes = Vec::new();
        let mut tx_id = index.contiguous.next();
        while tx_id < max && holes.len() < limit {
            if !index.offsets.contains_key(&tx_id) {
                holes.push(tx_id);
            }
            tx_id = tx_id.next();
        }
        holes
    }

    /// Returns true if the transaction id is journaled.
    #[must_use]
    pub fn contains(&self, tx_id: TxId) -> bool {
        self.index.read().offsets.contains_key(&tx_id)
    }

    /// Number of journaled records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().offsets.len()
    }

    /// Returns true if nothing has been journaled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the record for one transaction id.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame cannot be read.
    pub fn get(&self, tx_id: TxId) -> JournalResult<Option<JournalRecord>> {
        let Some(offset) = self.index.read().offsets.get(&tx_id).copied() else {
            return Ok(None);
        };
        self.read_at(offset).map(Some)
    }

    /// Highest id journaled as committed, or [`TxId::NONE`]. Rollback
    /// markers above it are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame cannot be read.
    pub fn last_committed_tx_id(&self) -> JournalResult<TxId> {
        let mut below = Bound::Unbounded;
        loop {
            let newest = self
                .index
                .read()
                .offsets
                .range((Bound::Unbounded, below))
                .next_back()
                .map(|(tx_id, offset)| (*tx_id, *offset));
            let Some((tx_id, offset)) = newest else {
                return Ok(TxId::NONE);
            };
            if let JournalRecord::Committed(_) = self.read_at(offset)? {
                return Ok(tx_id);
            }
            below = Bound::Excluded(tx_id);
        }
    }

    /// Records with `after < tx_id <= up_to`, in transaction id order.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame cannot be read.
    pub fn entries_between(&self, after: TxId, up_to: TxId) -> JournalResult<Vec<JournalRecord>> {
        if up_to <= after {
            return Ok(Vec::new());
        }

        let offsets: Vec<u64> = self
            .index
            .read()
            .offsets
            .range((Bound::Excluded(after), Bound::Included(up_to)))
            .map(|(_, offset)| *offset)
            .collect();

        offsets.into_iter().map(|offset| self.read_at(offset)).collect()
    }

    fn read_at(&self, offset: u64) -> JournalResult<JournalRecord> {
        let mut iter = JournalIterator::new(self.backend.lock(), offset)?;
        match iter.next() {
            Some(Ok((_, record))) => Ok(record),
            Some(Err(e)) => Err(e),
            None => Err(JournalError::corruption(format!(
                "indexed frame at offset {offset} is missing"
            ))),
        }
    }

    /// Finds the record produced by a task by scanning the whole journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read.
    pub fn find_task(&self, task_id: TaskId) -> JournalResult<Option<JournalRecord>> {
        for item in self.iter()? {
            let (_, record) = item?;
            if record.task_id() == task_id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Returns a streaming iterator over all frames in append order.
    ///
    /// The backend stays locked while the iterator is alive.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be accessed.
    pub fn iter(&self) -> JournalResult<JournalIterator<'_>> {
        JournalIterator::new(self.backend.lock(), 0)
    }

    /// Reads every frame and summarizes the journal.
    ///
    /// # Errors
    ///
    /// Returns the first corruption or I/O error encountered.
    pub fn verify(&self) -> JournalResult<JournalReport> {
        let mut report = JournalReport::default();
        let mut seen = Vec::new();

        for item in self.iter()? {
            let (_, record) = item?;
            report.records += 1;
            if record.is_committed() {
                report.committed += 1;
            } else {
                report.rolled_back += 1;
            }
            seen.push(record.tx_id());
        }

        seen.sort();
        report.first_tx = seen.first().copied();
        report.last_tx = seen.last().copied();
        if let (Some(first), Some(last)) = (report.first_tx, report.last_tx) {
            report.gaps = (last.as_i64() - first.as_i64() + 1) as u64 - report.records;
        }
        report.bytes = self.backend.lock().size()?;

        Ok(report)
    }

    /// Path of the journal file, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns true until the journal is closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flushes and closes the journal. Later appends fail with
    /// [`JournalError::Closed`]; reads keep working.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn close(&self) -> JournalResult<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.backend.lock().flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("records", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}
