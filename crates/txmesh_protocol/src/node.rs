//! Cluster node identity.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::str::FromStr;

/// Stable unique identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id, rejecting empty names and names containing `@`.
    pub fn new(id: impl Into<String>) -> ProtocolResult<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('@') || id.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidIdentifier(format!(
                "node id '{id}' must be non-empty without '@' or whitespace"
            )));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cluster node: identity plus network address.
///
/// Equality and hashing consider only the identity, so a node that
/// reconnects from a different address is still the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable identity.
    pub id: NodeId,
    /// Network address the node listens on.
    pub address: SocketAddr,
}

impl Node {
    /// Creates a node.
    #[must_use]
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self { id, address }
    }

    /// Returns the listening port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

impl FromStr for Node {
    type Err = ProtocolError;

    /// Parses a peer spec of the form `id@host:port`.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (id, addr) = spec
            .trim()
            .split_once('@')
            .ok_or_else(|| ProtocolError::invalid_node_spec(spec, "expected 'id@host:port'"))?;

        let id = NodeId::new(id).map_err(|e| ProtocolError::invalid_node_spec(spec, e.to_string()))?;
        let address = addr
            .parse::<SocketAddr>()
            .map_err(|e| ProtocolError::invalid_node_spec(spec, e.to_string()))?;

        Ok(Self { id, address })
    }
}
