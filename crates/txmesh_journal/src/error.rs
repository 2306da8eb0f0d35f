//! Error types for journal operations.

use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur while reading or writing a journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the journal.
    #[error("read beyond end of journal: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current journal size.
        size: u64,
    },

    /// The journal is corrupted.
    #[error("journal corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Record payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] txmesh_protocol::ProtocolError),

    /// Another process holds the journal directory.
    #[error("journal directory locked: {0}")]
    Locked(String),

    /// The journal directory is unusable.
    #[error("journal directory not usable: {0}")]
    Directory(String),

    /// The journal was closed.
    #[error("journal is closed")]
    Closed,
}

impl JournalError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Returns true if the error indicates damaged journal data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            JournalError::Corruption { .. } | JournalError::ChecksumMismatch { .. }
        )
    }
}
