//! Journal file on disk.

use crate::backend::{check_read, JournalBackend};
use crate::error::{JournalError, JournalResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// One journal file, opened for appending.
///
/// The owning [`crate::Journal`] serializes every access, so the store
/// holds no locks. Appended frames are durable once `flush` returns.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    len: u64,
}

impl FileStore {
    /// Opens the journal file at `path`, creating it empty if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> JournalResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl JournalBackend for FileStore {
    fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        check_read(offset, len, self.len)?;
        let mut frame = vec![0u8; len];
        if len > 0 {
            let mut file = &self.file;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut frame)?;
        }
        Ok(frame)
    }

    fn append(&mut self, data: &[u8]) -> JournalResult<u64> {
        // Append mode writes at the end whatever the last read seeked to
        let offset = self.len;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(offset)
    }

    fn flush(&mut self) -> JournalResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> JournalResult<u64> {
        Ok(self.len)
    }

    fn truncate(&mut self, new_size: u64) -> JournalResult<()> {
        if new_size > self.len {
            return Err(JournalError::corruption(format!(
                "cannot cut journal of {} bytes at {new_size}",
                self.len
            )));
        }
        self.file.set_len(new_size)?;
        self.file.sync_all()?;
        self.len = new_size;
        Ok(())
    }
}
