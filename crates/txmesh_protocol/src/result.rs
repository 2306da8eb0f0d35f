//! Structured results returned by every remote protocol step.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known result codes. Zero means success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// Step succeeded.
    Success = 0,
    /// The resource manager reported a failure.
    ResourceFailure = 1,
    /// No resource manager is registered under the requested id.
    NotRegistered = 2,
    /// The resource manager is not `UP_TO_DATE`.
    NotReady = 3,
    /// The call could not be delivered or timed out.
    Transport = 4,
    /// The transaction id is not known to the participant.
    UnknownTransaction = 5,
    /// The node is shutting down.
    ShuttingDown = 6,
}

impl OpCode {
    /// Converts a raw code to a known code.
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::ResourceFailure),
            2 => Some(Self::NotRegistered),
            3 => Some(Self::NotReady),
            4 => Some(Self::Transport),
            5 => Some(Self::UnknownTransaction),
            6 => Some(Self::ShuttingDown),
            _ => None,
        }
    }

    /// Returns the raw code.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Result code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    /// `0` on success, non-zero on failure.
    pub code: i32,
    /// Failure description.
    pub message: Option<String>,
}

impl OpResult {
    /// A successful result.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            code: 0,
            message: None,
        }
    }

    /// A failed result with one of the well-known codes.
    pub fn failure(code: OpCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i32(),
            message: Some(message.into()),
        }
    }

    /// A resource-manager failure.
    pub fn resource_failure(message: impl Into<String>) -> Self {
        Self::failure(OpCode::ResourceFailure, message)
    }

    /// Returns true on success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == 0
    }

    /// Returns the well-known code, if any.
    #[must_use]
    pub fn op_code(&self) -> Option<OpCode> {
        OpCode::from_i32(self.code)
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "code {}: {}", self.code, msg),
            None => write!(f, "code {}", self.code),
        }
    }
}
