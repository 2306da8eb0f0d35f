//! # txmesh testkit
//!
//! Test utilities for txmesh.
//!
//! This crate provides:
//! - An in-process loopback network implementing the transport substrate
//! - Scriptable resource managers recording every callback
//! - Multi-node cluster fixtures and polling helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use txmesh_testkit::prelude::*;
//!
//! #[test]
//! fn commits_everywhere() {
//!     let cluster = TestCluster::new(3);
//!     cluster.start_and_settle();
//!     let task = cluster.node(0).manager.submit(ResourceId::from(TEST_RESOURCE), vec![1])?;
//!     // ...
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod network;
pub mod resmgr;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::network::*;
    pub use crate::resmgr::*;
}

pub use cluster::{test_config, test_node, wait_until, TestCluster, TestNode, TEST_RESOURCE};
pub use network::{CallRecord, LoopbackNetwork, LoopbackTransport};
pub use resmgr::{RmCall, ScriptedResourceManager};
