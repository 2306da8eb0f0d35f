//! Journal backend trait definition.

use crate::error::{JournalError, JournalResult};

/// A byte store underneath a journal.
///
/// Backends are **opaque**: they do not understand journal frames. The
/// journal owns all format interpretation.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `flush` makes all appended data durable
pub trait JournalBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read extends beyond the current size or an
    /// I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> JournalResult<u64>;

    /// Flushes appended data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> JournalResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> JournalResult<u64>;

    /// Truncates to `new_size` bytes. Used to drop a torn trailing record.
    ///
    /// # Errors
    ///
    /// Returns an error if truncation fails.
    fn truncate(&mut self, new_size: u64) -> JournalResult<()>;
}

/// Rejects reads reaching past `size`.
pub(crate) fn check_read(offset: u64, len: usize, size: u64) -> JournalResult<()> {
    if offset.saturating_add(len as u64) > size {
        return Err(JournalError::ReadPastEnd { offset, len, size });
    }
    Ok(())
}
