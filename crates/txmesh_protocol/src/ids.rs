//! Identifier newtypes.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Cluster-wide transaction identifier.
///
/// Transaction ids are issued from a cluster-shared counter and never
/// decrease. [`TxId::NONE`] marks "no transaction yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub i64);

impl TxId {
    /// Sentinel for "no transaction completed yet".
    pub const NONE: TxId = TxId(-1);

    /// Creates a transaction id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns true if this is the [`TxId::NONE`] sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == Self::NONE.0
    }

    /// Returns the id that follows this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Number of transaction ids in the half-open range `(self, up_to]`.
    #[must_use]
    pub fn distance_to(self, up_to: TxId) -> u64 {
        if up_to.0 <= self.0 {
            0
        } else {
            (up_to.0 - self.0) as u64
        }
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "tx:none")
        } else {
            write!(f, "tx:{}", self.0)
        }
    }
}

/// Client-visible task identifier returned by `submit`.
///
/// Distinct from the transaction id, which is only assigned once the
/// coordinator dequeues the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generates a fresh random task id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero task id, used for records whose task is not known
    /// locally.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered resource manager.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a resource id, rejecting empty names.
    pub fn new(id: impl Into<String>) -> ProtocolResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProtocolError::InvalidIdentifier(
                "resource id must not be empty".into(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_id_sentinel() {
        assert!(TxId::NONE.is_none());
        assert_eq!(TxId::default(), TxId::NONE);
        assert_eq!(TxId::NONE.next(), TxId::new(0));
        assert_eq!(TxId::NONE.to_string(), "tx:none");
        assert_eq!(TxId::new(7).to_string(), "tx:7");
    }

    #[test]
    fn tx_id_distance() {
        assert_eq!(TxId::NONE.distance_to(TxId::new(4)), 5);
        assert_eq!(TxId::new(4).distance_to(TxId::new(4)), 0);
        assert_eq!(TxId::new(9).distance_to(TxId::new(4)), 0);
    }

    #[test]
    fn resource_id_rejects_empty() {
        assert!(ResourceId::new("  ").is_err());
        assert_eq!(ResourceId::new("blocks").unwrap().as_str(), "blocks");
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }
}
