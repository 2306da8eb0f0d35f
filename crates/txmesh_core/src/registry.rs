//! Node registry and quorum tracker.

use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, EventBus};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use txmesh_protocol::{Node, NodeId};

/// Returns true if `count` is a strict majority of `registered`.
///
/// Ties lose: two of four is not a quorum.
#[must_use]
pub fn counts_as_quorum(count: usize, registered: usize) -> bool {
    registered > 0 && count * 2 > registered
}

/// Tracks the registered peers and the online subset.
///
/// The local node is always registered. It is online while the
/// coordinator is started.
pub struct NodeRegistry {
    local: Node,
    registered: RwLock<BTreeMap<NodeId, Node>>,
    online: RwLock<BTreeMap<NodeId, Node>>,
    events: Arc<EventBus>,
}

impl NodeRegistry {
    /// Creates a registry containing only the local node.
    pub fn new(local: Node, events: Arc<EventBus>) -> Self {
        let mut registered = BTreeMap::new();
        registered.insert(local.id.clone(), local.clone());
        Self {
            local,
            registered: RwLock::new(registered),
            online: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// The local node.
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Registers a peer.
    ///
    /// With `enforce_quorum`, registration is refused unless quorum is
    /// online for the current registered set, so the cluster cannot grow
    /// into a size whose majority it cannot reach.
    ///
    /// # Errors
    ///
    /// - [`ClusterError::AlreadyRegistered`] for a known id
    /// - [`ClusterError::PeerRejected`] when quorum is not online
    pub fn register_peer(&self, node: Node, enforce_quorum: bool) -> ClusterResult<()> {
        let mut registered = self.registered.write();
        if registered.contains_key(&node.id) {
            return Err(ClusterError::AlreadyRegistered(node.id.to_string()));
        }

        if enforce_quorum {
            let online = self.online.read().len();
            if !counts_as_quorum(online, registered.len()) {
                warn!(
                    peer = %node,
                    online,
                    registered = registered.len(),
                    "refusing peer registration without quorum"
                );
                return Err(ClusterError::PeerRejected(format!(
                    "{}: quorum not online ({online} of {} peers)",
                    node.id,
                    registered.len()
                )));
            }
        }

        registered.insert(node.id.clone(), node.clone());
        drop(registered);

        info!(peer = %node, "peer registered");
        self.events.publish(ClusterEvent::PeerRegistered(node));
        Ok(())
    }

    /// Unregisters a peer, taking it offline first.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::PeerRejected`] for the local node.
    pub fn unregister_peer(&self, id: &NodeId) -> ClusterResult<Option<Node>> {
        if id == &self.local.id {
            return Err(ClusterError::PeerRejected(
                "the local node cannot be unregistered".to_string(),
            ));
        }

        self.remove_online_peer(id);
        let removed = self.registered.write().remove(id);
        if let Some(node) = &removed {
            info!(peer = %node, "peer unregistered");
            self.events.publish(ClusterEvent::PeerUnregistered(node.clone()));
        }
        Ok(removed)
    }

    /// Returns the registered node with this id.
    pub fn registered(&self, id: &NodeId) -> Option<Node> {
        self.registered.read().get(id).cloned()
    }

    /// Returns true if the id is registered.
    pub fn is_registered(&self, id: &NodeId) -> bool {
        self.registered.read().contains_key(id)
    }

    /// Registered peers, the local node included, ordered by id.
    pub fn registered_peers(&self) -> Vec<Node> {
        self.registered.read().values().cloned().collect()
    }

    /// Online peers, the local node included, ordered by id.
    pub fn online_peers(&self) -> Vec<Node> {
        self.online.read().values().cloned().collect()
    }

    /// Returns true if the id is online.
    pub fn is_online(&self, id: &NodeId) -> bool {
        self.online.read().contains_key(id)
    }

    /// Marks a confirmed peer online.
    ///
    /// Unregistered nodes are ignored. Returns true if the peer was not
    /// online before.
    pub fn add_online_peer(&self, node: &Node) -> bool {
        let Some(registered) = self.registered(&node.id) else {
            warn!(peer = %node, "ignoring unregistered member");
            return false;
        };

        let added = self
            .online
            .write()
            .insert(registered.id.clone(), registered.clone())
            .is_none();
        if added {
            let quorum = self.is_quorum_online();
            info!(peer = %registered, quorum, "peer online");
            self.events.publish(ClusterEvent::PeerOnline {
                node: registered,
                quorum,
            });
        }
        added
    }

    /// Marks a peer offline. Returns true if it was online.
    pub fn remove_online_peer(&self, id: &NodeId) -> bool {
        let removed = self.online.write().remove(id);
        match removed {
            Some(node) => {
                let quorum = self.is_quorum_online();
                info!(peer = %node, quorum, "peer offline");
                self.events.publish(ClusterEvent::PeerOffline { node, quorum });
                true
            }
            None => false,
        }
    }

    /// Marks the local node online.
    pub fn mark_local_online(&self) {
        let local = self.local.clone();
        self.add_online_peer(&local);
    }

    /// Takes every node offline, silently.
    pub fn clear_online(&self) {
        self.online.write().clear();
    }

    /// True iff online peers are a strict majority of registered peers.
    pub fn is_quorum_online(&self) -> bool {
        let registered = self.registered.read().len();
        let online = self.online.read().len();
        counts_as_quorum(online, registered)
    }

    /// Returns true if `count` nodes are a strict majority of the
    /// registered peers.
    pub fn counts_as_quorum(&self, count: usize) -> bool {
        counts_as_quorum(count, self.registered.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: &str, port: u16) -> Node {
        format!("{id}@127.0.0.1:{port}").parse().unwrap()
    }

    fn registry_of(n: usize) -> NodeRegistry {
        let registry = NodeRegistry::new(node("n0", 7000), Arc::new(EventBus::new(1, 1)));
        for i in 1..n {
            registry
                .register_peer(node(&format!("n{i}"), 7000 + i as u16), false)
                .unwrap();
        }
        registry
    }

    #[test]
    fn two_of_three_is_quorum() {
        let registry = registry_of(3);
        registry.mark_local_online();
        assert!(!registry.is_quorum_online());

        registry.add_online_peer(&node("n1", 7001));
        assert!(registry.is_quorum_online());
    }

    #[test]
    fn one_of_three_is_not() {
        let registry = registry_of(3);
        registry.mark_local_online();
        assert!(!registry.is_quorum_online());
        assert!(!registry.counts_as_quorum(1));
        assert!(registry.counts_as_quorum(2));
    }

    #[test]
    fn ties_lose() {
        assert!(!counts_as_quorum(2, 4));
        assert!(counts_as_quorum(3, 4));
        assert!(!counts_as_quorum(0, 0));
    }

    #[test]
    fn unregistered_members_are_ignored() {
        let registry = registry_of(2);
        assert!(!registry.add_online_peer(&node("stranger", 9000)));
        assert!(registry.online_peers().is_empty());
    }

    #[test]
    fn registration_without_quorum_is_refused() {
        let registry = registry_of(3);
        registry.mark_local_online();

        let err = registry.register_peer(node("n3", 7003), true).unwrap_err();
        assert!(matches!(err, ClusterError::PeerRejected(_)));
        assert_eq!(registry.registered_peers().len(), 3);

        registry.add_online_peer(&node("n1", 7001));
        registry.register_peer(node("n3", 7003), true).unwrap();
        assert_eq!(registry.registered_peers().len(), 4);
    }

    #[test]
    fn duplicate_and_local_registration() {
        let registry = registry_of(2);
        assert!(matches!(
            registry.register_peer(node("n1", 7001), false),
            Err(ClusterError::AlreadyRegistered(_))
        ));
        assert!(registry.unregister_peer(&registry.local().id.clone()).is_err());
    }

    #[test]
    fn unregister_takes_peer_offline() {
        let registry = registry_of(3);
        registry.mark_local_online();
        registry.add_online_peer(&node("n2", 7002));
        assert!(registry.is_online(&NodeId::new("n2").unwrap()));

        let removed = registry
            .unregister_peer(&NodeId::new("n2").unwrap())
            .unwrap();
        assert!(removed.is_some());
        assert!(!registry.is_online(&NodeId::new("n2").unwrap()));
        assert_eq!(registry.registered_peers().len(), 2);
    }

    proptest! {
        #[test]
        fn quorum_is_strict_majority(registered in 1usize..12, online_frac in 0usize..=100) {
            let online = registered * online_frac / 100;
            let registry = registry_of(registered);
            let peers = registry.registered_peers();
            for peer in peers.iter().take(online) {
                registry.add_online_peer(peer);
            }
            prop_assert_eq!(registry.is_quorum_online(), online * 2 > registered);
        }
    }
}
