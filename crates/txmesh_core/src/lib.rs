//! # txmesh core
//!
//! Distributed transaction coordinator for txmesh storage nodes.
//!
//! This crate provides:
//! - Node registry and strict-majority quorum tracking
//! - Resource manager registry and the per-resource synchronization state machine
//! - Synchronization engine (discovery, journal replay, post-sync processing)
//! - Transaction coordinator driving two-phase commit across the online peers
//! - Participant-side protocol handlers and the transaction monitor (watchdog)
//! - Task tracking with retention-based purge
//! - Ordered, at-least-once event bus
//! - The [`Manager`] facade tying it all together
//!
//! ## Architecture
//!
//! ```text
//!            Manager (lifecycle lock)
//!               │
//!   ┌───────────┼──────────────┬──────────────┐
//!   ▼           ▼              ▼              ▼
//! Coordinator  Synchronizer  ProtocolHandler  TaskTracker
//!   │           │              │
//!   └───────────┴──────┬───────┘
//!                      ▼
//!      NodeRegistry · ResMgrRegistry · EventBus
//!                      │
//!                      ▼
//!              ClusterTransport (external)
//! ```
//!
//! ## Key Invariants
//!
//! - Quorum is a strict majority of registered peers (ties lose)
//! - Transaction ids never decrease cluster-wide
//! - Only `UP_TO_DATE` resource managers accept new transactions
//! - `UP_TO_DATE` is only ever entered from `POST_SYNC_PROCESSING`
//! - Protocol steps return structured results, never errors

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod cluster;
mod config;
mod context;
mod coordinator;
mod error;
mod events;
mod handler;
mod manager;
mod membership;
mod monitor;
mod registry;
mod resmgr;
mod status;
mod sync;
mod tasks;
mod transport;

pub use config::{ClusterConfig, RetryConfig, TaskRetention};
pub use context::TxContext;
pub use error::{ClusterError, ClusterResult};
pub use events::{ClusterEvent, ClusterListener, DeadLetter, EventBus, ListenerResult, SubscriptionId};
pub use manager::{Manager, NodeInfo, ReentrantManager, ResMgrInfo};
pub use monitor::MonitorHandle;
pub use registry::{counts_as_quorum, NodeRegistry};
pub use resmgr::ResourceManager;
pub use status::{ClusterStatus, SyncState};
pub use sync::DiscoveryOutcome;
pub use tasks::{TaskRecord, TaskTracker};
pub use transport::{
    call_with_retry, AtomicCounter, ClusterTransport, DistributedCounter, MembershipListener,
    RemoteHandler, TransportError, TransportResult,
};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
