//! Identity confirmation of joining group members.

use crate::cluster::Cluster;
use crate::transport::MembershipListener;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, warn};
use txmesh_protocol::{Node, NodeId, RemoteOp, RemoteReply};

/// Turns transport membership changes into online/offline transitions.
///
/// A joining member only counts once it answered an `Identify` call with
/// the expected cluster name and id, is registered, and is still a
/// member when the confirmation returns.
pub(crate) struct MembershipTracker {
    cluster: Weak<Cluster>,
    /// Orders confirmations against departures.
    changes: Arc<Mutex<()>>,
}

impl MembershipTracker {
    pub fn new(cluster: Weak<Cluster>) -> Self {
        Self {
            cluster,
            changes: Arc::new(Mutex::new(())),
        }
    }
}

fn confirm(cluster: &Cluster, node: &Node) -> Result<Node, String> {
    let attempts = cluster.config.identity_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            thread::sleep(cluster.config.identity_backoff);
        }
        if cluster.transport.is_shutting_down() || !cluster.is_serving() {
            return Err("node stopping".to_string());
        }
        match cluster
            .transport
            .call(node, &RemoteOp::Identify, cluster.config.call_timeout)
        {
            Ok(RemoteReply::Identity {
                node: identity,
                cluster: name,
            }) => {
                if name != cluster.config.cluster_name {
                    return Err(format!("belongs to cluster {name}"));
                }
                if identity.id != node.id {
                    return Err(format!("identifies as {}", identity.id));
                }
                return Ok(identity);
            }
            Ok(other) => last_error = format!("unexpected reply {other:?}"),
            Err(e) => {
                debug!(peer = %node.id, attempt, error = %e, "identify failed");
                last_error = e.to_string();
            }
        }
    }
    Err(last_error)
}

impl MembershipListener for MembershipTracker {
    fn member_joined(&self, node: Node) {
        let Some(cluster) = self.cluster.upgrade() else {
            return;
        };
        if node.id == cluster.local().id {
            return;
        }

        let changes = Arc::clone(&self.changes);
        let spawned = thread::Builder::new()
            .name(format!("txmesh-identify-{}", node.id))
            .spawn(move || match confirm(&cluster, &node) {
                Ok(identity) => {
                    if !cluster.nodes.is_registered(&identity.id) {
                        warn!(peer = %identity, "member is not a registered peer, ignoring");
                        return;
                    }
                    let _changes = changes.lock();
                    let still_member = cluster
                        .transport
                        .members()
                        .iter()
                        .any(|member| member.id == identity.id);
                    if !still_member {
                        info!(peer = %identity, "member left before its identity was confirmed");
                        return;
                    }
                    info!(peer = %identity, "member identity confirmed");
                    cluster.nodes.add_online_peer(&identity);
                }
                Err(reason) => warn!(peer = %node, %reason, "member identity not confirmed, ignoring"),
            });
        if spawned.is_err() {
            warn!("could not spawn identity confirmation thread");
        }
    }

    fn member_left(&self, node: &NodeId) {
        let Some(cluster) = self.cluster.upgrade() else {
            return;
        };
        let _changes = self.changes.lock();
        if cluster.nodes.remove_online_peer(node) {
            debug!(peer = %node, "member left");
        }
    }
}
