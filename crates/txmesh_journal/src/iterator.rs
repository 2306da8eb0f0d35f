//! Streaming journal reader.

use crate::backend::JournalBackend;
use crate::error::{JournalError, JournalResult};
use crate::record::{compute_crc32, decode_frame, FrameType, CRC_SIZE, HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_VERSION};
use parking_lot::MutexGuard;
use txmesh_protocol::JournalRecord;

/// A streaming iterator over journal frames.
///
/// Reads one frame at a time from the backend, yielding
/// `(offset, JournalRecord)` pairs. A truncated trailing frame ends the
/// iteration cleanly; any other damage yields an error and stops.
pub struct JournalIterator<'a> {
    backend: MutexGuard<'a, Box<dyn JournalBackend>>,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> JournalIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be determined.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn JournalBackend>>,
        start_offset: u64,
    ) -> JournalResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: start_offset,
            finished: false,
        })
    }

    /// Offset just past the last complete frame read so far.
    ///
    /// After the iterator is exhausted this is where valid data ends.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> JournalResult<Option<(u64, JournalRecord)>> {
        let start = self.offset;
        let remaining = self.total_size.saturating_sub(start);

        if remaining < HEADER_SIZE as u64 {
            // Truncated header (or clean end)
            return Ok(None);
        }

        let header = self.backend.read_at(start, HEADER_SIZE)?;

        if header[0..4] != JOURNAL_MAGIC {
            return Err(JournalError::corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > JOURNAL_VERSION {
            return Err(JournalError::corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        let frame_type = FrameType::from_byte(type_byte).ok_or_else(|| {
            JournalError::corruption(format!("unknown frame type {type_byte} at offset {start}"))
        })?;

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;

        if remaining < total_len as u64 {
            // Torn write at the tail
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start + HEADER_SIZE as u64, payload_len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(payload_len);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut covered = header;
        covered.extend_from_slice(payload);
        let computed_crc = compute_crc32(&covered);

        if stored_crc != computed_crc {
            return Err(JournalError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = decode_frame(frame_type, payload)?;
        self.offset += total_len as u64;

        Ok(Some((start, record)))
    }
}

impl Iterator for JournalIterator<'_> {
    type Item = JournalResult<(u64, JournalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
