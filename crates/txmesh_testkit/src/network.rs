//! In-process cluster network.
//!
//! Every node gets a [`LoopbackTransport`] attached to one shared
//! [`LoopbackNetwork`]. Calls run the target's handler on the caller's
//! thread, after a CBOR round trip of both the operation and the reply so
//! the wire types are exercised. Counters are shared by name across the
//! whole network. Links can be cut and healed; membership listeners are
//! notified the way a group membership service would.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;
use txmesh_core::{
    AtomicCounter, ClusterTransport, DistributedCounter, MembershipListener, RemoteHandler,
    TransportError, TransportResult,
};
use txmesh_protocol::{from_cbor, to_cbor, Node, NodeId, RemoteOp, RemoteReply};

struct Endpoint {
    node: Node,
    cluster: String,
    handler: Arc<dyn RemoteHandler>,
    membership: Arc<dyn MembershipListener>,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// Calling node.
    pub from: NodeId,
    /// Called node.
    pub to: NodeId,
    /// The operation.
    pub op: RemoteOp,
}

enum Notice {
    Joined(Arc<dyn MembershipListener>, Node),
    Left(Arc<dyn MembershipListener>, NodeId),
}

impl Notice {
    fn deliver(self) {
        match self {
            Notice::Joined(listener, node) => listener.member_joined(node),
            Notice::Left(listener, id) => listener.member_left(&id),
        }
    }
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<BTreeMap<NodeId, Endpoint>>,
    cut: Mutex<BTreeSet<(NodeId, NodeId)>>,
    latency: Mutex<HashMap<NodeId, Duration>>,
    counters: Mutex<HashMap<String, Arc<AtomicCounter>>>,
    calls: Mutex<Vec<CallRecord>>,
}

fn link(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl NetworkInner {
    fn is_cut(&self, a: &NodeId, b: &NodeId) -> bool {
        self.cut.lock().contains(&link(a, b))
    }

    /// Whether `a` and `b` see each other right now.
    fn visible(&self, endpoints: &BTreeMap<NodeId, Endpoint>, a: &NodeId, b: &NodeId) -> bool {
        match (endpoints.get(a), endpoints.get(b)) {
            (Some(ea), Some(eb)) => ea.cluster == eb.cluster && !self.is_cut(a, b),
            _ => false,
        }
    }

    fn counter(&self, name: &str) -> Arc<AtomicCounter> {
        Arc::clone(
            self.counters
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicCounter::default())),
        )
    }
}

/// A shared in-process network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the transport of `node`.
    pub fn transport(&self, node: Node) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: Arc::clone(&self.inner),
            node,
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Returns true if `node` is connected.
    pub fn is_connected(&self, node: &NodeId) -> bool {
        self.inner.endpoints.lock().contains_key(node)
    }

    /// Cuts the link between `a` and `b`.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        let notices = {
            let endpoints = self.inner.endpoints.lock();
            let was_visible = self.inner.visible(&endpoints, a, b);
            self.inner.cut.lock().insert(link(a, b));
            if was_visible {
                leave_notices(&endpoints, a, b)
            } else {
                Vec::new()
            }
        };
        notices.into_iter().for_each(Notice::deliver);
    }

    /// Cuts every link of `node`.
    pub fn isolate(&self, node: &NodeId) {
        let others: Vec<NodeId> = self
            .inner
            .endpoints
            .lock()
            .keys()
            .filter(|id| *id != node)
            .cloned()
            .collect();
        for other in others {
            self.partition(node, &other);
        }
    }

    /// Restores the link between `a` and `b`.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        let notices = {
            let endpoints = self.inner.endpoints.lock();
            let removed = self.inner.cut.lock().remove(&link(a, b));
            if removed && self.inner.visible(&endpoints, a, b) {
                join_notices(&endpoints, a, b)
            } else {
                Vec::new()
            }
        };
        notices.into_iter().for_each(Notice::deliver);
    }

    /// Restores every link.
    pub fn heal_all(&self) {
        let cut: Vec<(NodeId, NodeId)> = self.inner.cut.lock().iter().cloned().collect();
        for (a, b) in cut {
            self.heal(&a, &b);
        }
    }

    /// Delays every call served by `node`.
    pub fn set_latency(&self, node: &NodeId, latency: Duration) {
        self.inner.latency.lock().insert(node.clone(), latency);
    }

    /// Current value of a shared counter.
    pub fn counter_value(&self, name: &str) -> i64 {
        self.inner
            .counter(name)
            .get()
            .unwrap_or_default()
    }

    /// Delivers `op` to `to` as if `from` had sent it, bypassing links.
    pub fn send(&self, from: &NodeId, to: &NodeId, op: RemoteOp) -> TransportResult<RemoteReply> {
        let handler = {
            let endpoints = self.inner.endpoints.lock();
            let endpoint = endpoints
                .get(to)
                .ok_or_else(|| TransportError::Unreachable(to.clone()))?;
            Arc::clone(&endpoint.handler)
        };
        Ok(handler.handle(from, op))
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.inner.calls.lock().clone()
    }

    /// Calls addressed to `to` for which `filter` holds.
    pub fn calls_to(&self, to: &NodeId, filter: impl Fn(&RemoteOp) -> bool) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| &call.to == to && filter(&call.op))
            .count()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }
}

fn join_notices(endpoints: &BTreeMap<NodeId, Endpoint>, a: &NodeId, b: &NodeId) -> Vec<Notice> {
    let mut notices = Vec::new();
    if let (Some(ea), Some(eb)) = (endpoints.get(a), endpoints.get(b)) {
        notices.push(Notice::Joined(Arc::clone(&ea.membership), eb.node.clone()));
        notices.push(Notice::Joined(Arc::clone(&eb.membership), ea.node.clone()));
    }
    notices
}

fn leave_notices(endpoints: &BTreeMap<NodeId, Endpoint>, a: &NodeId, b: &NodeId) -> Vec<Notice> {
    let mut notices = Vec::new();
    if let (Some(ea), Some(eb)) = (endpoints.get(a), endpoints.get(b)) {
        notices.push(Notice::Left(Arc::clone(&ea.membership), b.clone()));
        notices.push(Notice::Left(Arc::clone(&eb.membership), a.clone()));
    }
    notices
}

/// The transport of one node on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: Arc<NetworkInner>,
    node: Node,
    connected: AtomicBool,
    shutting_down: AtomicBool,
}

impl ClusterTransport for LoopbackTransport {
    fn local_node(&self) -> Node {
        self.node.clone()
    }

    fn connect(
        &self,
        cluster_name: &str,
        _secret: Option<&str>,
        handler: Arc<dyn RemoteHandler>,
        membership: Arc<dyn MembershipListener>,
    ) -> TransportResult<()> {
        let notices = {
            let mut endpoints = self.network.endpoints.lock();
            if endpoints.contains_key(&self.node.id) {
                return Err(TransportError::Codec(format!(
                    "{} is already connected",
                    self.node.id
                )));
            }
            endpoints.insert(
                self.node.id.clone(),
                Endpoint {
                    node: self.node.clone(),
                    cluster: cluster_name.to_string(),
                    handler,
                    membership,
                },
            );
            let peers: Vec<NodeId> = endpoints
                .keys()
                .filter(|id| **id != self.node.id)
                .cloned()
                .collect();
            peers
                .iter()
                .filter(|peer| self.network.visible(&endpoints, &self.node.id, peer))
                .flat_map(|peer| join_notices(&endpoints, &self.node.id, peer))
                .collect::<Vec<_>>()
        };
        self.connected.store(true, Ordering::SeqCst);
        self.shutting_down.store(false, Ordering::SeqCst);
        debug!(node = %self.node.id, cluster = cluster_name, "loopback connected");
        notices.into_iter().for_each(Notice::deliver);
        Ok(())
    }

    fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // The endpoint may belong to another transport with the same id
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let notices: Vec<Notice> = {
            let mut endpoints = self.network.endpoints.lock();
            let visible_to: Vec<Arc<dyn MembershipListener>> = endpoints
                .iter()
                .filter(|(id, _)| **id != self.node.id)
                .filter(|(id, _)| self.network.visible(&endpoints, &self.node.id, id))
                .map(|(_, endpoint)| Arc::clone(&endpoint.membership))
                .collect();
            endpoints.remove(&self.node.id);
            visible_to
                .into_iter()
                .map(|listener| Notice::Left(listener, self.node.id.clone()))
                .collect()
        };
        debug!(node = %self.node.id, "loopback disconnected");
        notices.into_iter().for_each(Notice::deliver);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn members(&self) -> Vec<Node> {
        if !self.connected.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let endpoints = self.network.endpoints.lock();
        endpoints
            .values()
            .filter(|endpoint| {
                endpoint.node.id == self.node.id
                    || self
                        .network
                        .visible(&endpoints, &self.node.id, &endpoint.node.id)
            })
            .map(|endpoint| endpoint.node.clone())
            .collect()
    }

    fn call(&self, target: &Node, op: &RemoteOp, timeout: Duration) -> TransportResult<RemoteReply> {
        let (handler, latency) = {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            let endpoints = self.network.endpoints.lock();
            if !self.network.visible(&endpoints, &self.node.id, &target.id) {
                return Err(TransportError::Unreachable(target.id.clone()));
            }
            let Some(endpoint) = endpoints.get(&target.id) else {
                return Err(TransportError::Unreachable(target.id.clone()));
            };
            let latency = self.network.latency.lock().get(&target.id).copied();
            (Arc::clone(&endpoint.handler), latency)
        };

        self.network.calls.lock().push(CallRecord {
            from: self.node.id.clone(),
            to: target.id.clone(),
            op: op.clone(),
        });

        if let Some(latency) = latency {
            if latency > timeout {
                thread::sleep(timeout);
                return Err(TransportError::Timeout {
                    node: target.id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(latency);
        }

        let wire = to_cbor(op).map_err(|e| TransportError::Codec(e.to_string()))?;
        let op: RemoteOp = from_cbor(&wire).map_err(|e| TransportError::Codec(e.to_string()))?;
        let reply = handler.handle(&self.node.id, op);
        let wire = to_cbor(&reply).map_err(|e| TransportError::Codec(e.to_string()))?;
        from_cbor(&wire).map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn counter(&self, name: &str) -> Arc<dyn DistributedCounter> {
        self.network.counter(name)
    }
}
