//! Multi-node clusters on a loopback network.

use crate::network::{LoopbackNetwork, LoopbackTransport};
use crate::resmgr::ScriptedResourceManager;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use txmesh_core::{ClusterConfig, Manager, RetryConfig, SyncState};
use txmesh_protocol::{Node, NodeId, ResourceId};

/// Resource id every test node registers.
pub const TEST_RESOURCE: &str = "blocks";

/// Polls `condition` every few milliseconds until it holds or `timeout`
/// elapses. Returns the last result.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// The `index`-th test node: `node-a`, `node-b`, ... on `127.0.0.1:7000+`.
pub fn test_node(index: usize) -> Node {
    let letter = char::from(b'a' + (index % 26) as u8);
    let id = NodeId::new(format!("node-{letter}")).expect("valid node id");
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7000 + index as u16);
    Node::new(id, address)
}

/// Configuration with timings short enough for tests.
pub fn test_config(cluster: &str, local: Node, peers: &[Node]) -> ClusterConfig {
    let mut config = ClusterConfig::new(cluster, local)
        .with_tx_timeout(Duration::from_secs(5))
        .with_call_timeout(Duration::from_millis(500))
        .with_discovery_timeout(Duration::from_millis(300))
        .with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
        .with_identity_confirmation(5, Duration::from_millis(20))
        .with_submit_timeout(Duration::from_secs(1))
        .with_sync_interval(Duration::from_millis(100));
    for peer in peers {
        config = config.with_peer(peer.clone());
    }
    config
}

/// One node of a [`TestCluster`].
pub struct TestNode {
    /// The node's identity.
    pub node: Node,
    /// Its coordinator.
    pub manager: Manager,
    /// Its resource manager for [`TEST_RESOURCE`].
    pub rm: Arc<ScriptedResourceManager>,
    /// Its transport.
    pub transport: Arc<LoopbackTransport>,
}

impl TestNode {
    /// Sync state of the test resource manager.
    pub fn state(&self) -> Option<SyncState> {
        self.manager
            .res_mgr(&ResourceId::from(TEST_RESOURCE))
            .map(|info| info.state)
    }

    /// Returns true once the test resource manager is `UP_TO_DATE`.
    pub fn is_up_to_date(&self) -> bool {
        self.state() == Some(SyncState::UpToDate)
    }

    /// Id of the node.
    pub fn id(&self) -> &NodeId {
        &self.node.id
    }
}

/// Initialized, not yet started nodes sharing one loopback network. Every
/// node registers every other one and carries a [`ScriptedResourceManager`].
pub struct TestCluster {
    /// The shared network.
    pub network: LoopbackNetwork,
    /// The nodes, `node-a` first.
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Builds `size` nodes with [`test_config`].
    pub fn new(size: usize) -> Self {
        Self::with_config(size, |config| config)
    }

    /// Builds `size` nodes, letting `customize` adjust each configuration.
    pub fn with_config(size: usize, customize: impl Fn(ClusterConfig) -> ClusterConfig) -> Self {
        let network = LoopbackNetwork::new();
        let all: Vec<Node> = (0..size).map(test_node).collect();

        let nodes = all
            .iter()
            .map(|node| {
                let transport = network.transport(node.clone());
                let config = customize(test_config("test-cluster", node.clone(), &all));
                let manager = Manager::new(config, transport.clone());
                manager.init().expect("init");
                let rm = Arc::new(ScriptedResourceManager::new(TEST_RESOURCE));
                manager
                    .register_resource_manager(rm.clone())
                    .expect("register resource manager");
                TestNode {
                    node: node.clone(),
                    manager,
                    rm,
                    transport,
                }
            })
            .collect();

        Self { network, nodes }
    }

    /// The `index`-th node.
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Starts one node.
    pub fn start(&self, index: usize) {
        self.nodes[index].manager.start().expect("start");
    }

    /// Starts every node.
    pub fn start_all(&self) {
        for index in 0..self.nodes.len() {
            self.start(index);
        }
    }

    /// Waits until every started node sees `count` online nodes.
    pub fn wait_online(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || {
            self.nodes
                .iter()
                .filter(|n| n.manager.status().is_started())
                .all(|n| n.manager.online_peers().len() >= count)
        })
    }

    /// Waits until the listed nodes are `UP_TO_DATE`.
    pub fn wait_up_to_date(&self, indexes: &[usize], timeout: Duration) -> bool {
        wait_until(timeout, || {
            indexes.iter().all(|index| self.nodes[*index].is_up_to_date())
        })
    }

    /// Starts every node and waits for full membership and `UP_TO_DATE`
    /// resource managers.
    pub fn start_and_settle(&self) {
        self.start_all();
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        assert!(
            self.wait_online(self.nodes.len(), Duration::from_secs(5)),
            "membership did not settle"
        );
        assert!(
            self.wait_up_to_date(&all, Duration::from_secs(5)),
            "resource managers did not synchronize"
        );
    }
}
