//! # txmesh protocol
//!
//! Wire vocabulary shared by every txmesh node.
//!
//! This crate provides:
//! - Node identity (`NodeId`, `Node`) and peer spec parsing
//! - Transaction, task and resource identifiers
//! - `Request` and `Transaction` records
//! - Structured step results (`OpResult`)
//! - The tagged remote operation variants (`RemoteOp`, `ProtocolOp`, `RemoteReply`)
//! - Journal records exchanged during synchronization
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod ids;
mod journal;
mod message;
mod node;
mod request;
mod result;

pub use codec::{from_cbor, to_cbor, CborMessage};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{ResourceId, TaskId, TxId};
pub use journal::{JournalEntry, JournalRecord};
pub use message::{ProtocolOp, RemoteOp, RemoteReply};
pub use node::{Node, NodeId};
pub use request::{Request, TaskStatus, Transaction};
pub use result::{OpCode, OpResult};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;
