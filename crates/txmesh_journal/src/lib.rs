//! # txmesh journal
//!
//! Append-only, per-resource-manager journal of transaction outcomes.
//!
//! Every transaction id of a resource manager is journaled exactly once,
//! either as a committed entry (with the replayable payload) or as a
//! rolled-back marker. The journal is used for:
//! - replaying missing transactions on a lagging node
//! - historical task lookup after the in-memory task index is purged
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of a [`txmesh_protocol::JournalRecord`].
//!
//! ## Recovery Policy
//!
//! - A truncated trailing record (crash mid-write) is a clean end of log.
//! - Bad magic, unknown record type, unsupported version or a CRC mismatch
//!   is fatal: the journal refuses to open.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod dir;
mod error;
mod file;
mod iterator;
mod journal;
mod memory;
mod record;

pub use backend::JournalBackend;
pub use dir::JournalDir;
pub use error::{JournalError, JournalResult};
pub use file::FileStore;
pub use iterator::JournalIterator;
pub use journal::{Journal, JournalReport};
pub use memory::MemoryStore;
pub use record::{compute_crc32, decode_frame, encode_frame, FrameType, HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_VERSION};
