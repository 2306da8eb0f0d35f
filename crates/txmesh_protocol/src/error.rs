//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or parsing protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A value could not be encoded to CBOR.
    #[error("encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded from CBOR.
    #[error("decode error: {0}")]
    Decode(String),

    /// A peer specification string is malformed.
    #[error("invalid node spec '{spec}': {reason}")]
    InvalidNodeSpec {
        /// The offending input.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An identifier is empty or otherwise unusable.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl ProtocolError {
    /// Creates an invalid node spec error.
    pub fn invalid_node_spec(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidNodeSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }
}
