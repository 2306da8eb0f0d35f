//! Journal bytes held in memory.

use crate::backend::{check_read, JournalBackend};
use crate::error::{JournalError, JournalResult};
use parking_lot::Mutex;
use std::sync::Arc;

/// Journal bytes in memory, lost with the process.
///
/// Clones share one buffer: a journal reopened over a clone sees what the
/// earlier instance wrote, torn tail included.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store over bytes read from a journal file.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current bytes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl JournalBackend for MemoryStore {
    fn read_at(&self, offset: u64, len: usize) -> JournalResult<Vec<u8>> {
        let bytes = self.bytes.lock();
        check_read(offset, len, bytes.len() as u64)?;
        let start = offset as usize;
        Ok(bytes[start..start + len].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> JournalResult<u64> {
        let mut bytes = self.bytes.lock();
        let offset = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn flush(&mut self) -> JournalResult<()> {
        Ok(())
    }

    fn size(&self) -> JournalResult<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> JournalResult<()> {
        let mut bytes = self.bytes.lock();
        if new_size > bytes.len() as u64 {
            return Err(JournalError::corruption(format!(
                "cannot cut journal of {} bytes at {new_size}",
                bytes.len()
            )));
        }
        bytes.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopened_clone_sees_earlier_frames() {
        let mut writer = MemoryStore::new();
        let reader = writer.clone();

        writer.append(b"frame").unwrap();
        assert_eq!(reader.size().unwrap(), 5);
        assert_eq!(reader.snapshot(), b"frame");
    }

    #[test]
    fn reads_stay_inside_the_journal() {
        let store = MemoryStore::from_bytes(b"abc".to_vec());
        assert!(matches!(
            store.read_at(2, 5),
            Err(JournalError::ReadPastEnd { .. })
        ));
        assert!(store.read_at(3, 0).unwrap().is_empty());
    }
}
