//! Configuration for the coordinator.

use crate::error::{ClusterError, ClusterResult};
use rand::Rng;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use txmesh_protocol::Node;

/// Configuration consumed by [`crate::Manager`].
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name. Peers must report the same name to be accepted.
    pub cluster_name: String,
    /// Shared secret handed to the transport on connect.
    pub secret: Option<String>,
    /// The local node.
    pub local: Node,
    /// Configured peers (the local node may be listed too).
    pub peers: Vec<Node>,
    /// Watchdog timeout per transaction and participant.
    pub tx_timeout: Duration,
    /// Timeout of one remote protocol call.
    pub call_timeout: Duration,
    /// Timeout of one discovery call.
    pub discovery_timeout: Duration,
    /// Retry policy for remote calls.
    pub retry: RetryConfig,
    /// Identity confirmation attempts for a joining member.
    pub identity_attempts: u32,
    /// Delay between identity confirmation attempts.
    pub identity_backoff: Duration,
    /// Journal directory. In-memory journals when unset.
    pub journal_dir: Option<PathBuf>,
    /// Concurrent submissions allowed through the admission gate.
    pub admission_permits: usize,
    /// Capacity of the pending request queue.
    pub queue_capacity: usize,
    /// Maximum time `submit` waits on the gate and the queue.
    pub submit_timeout: Duration,
    /// Interval between background synchronization rounds.
    pub sync_interval: Duration,
    /// Delivery attempts per event and subscriber.
    pub event_delivery_attempts: u32,
    /// Capacity of the dead-letter log.
    pub dead_letter_capacity: usize,
    /// Task record retention.
    pub retention: TaskRetention,
}

impl ClusterConfig {
    /// Creates a configuration with defaults for everything but the
    /// cluster name and the local node.
    pub fn new(cluster_name: impl Into<String>, local: Node) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            secret: None,
            local,
            peers: Vec::new(),
            tx_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(2),
            retry: RetryConfig::default(),
            identity_attempts: 5,
            identity_backoff: Duration::from_millis(200),
            journal_dir: None,
            admission_permits: 64,
            queue_capacity: 1024,
            submit_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_secs(5),
            event_delivery_attempts: 3,
            dead_letter_capacity: 256,
            retention: TaskRetention::default(),
        }
    }

    /// Sets the shared secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Adds a peer.
    pub fn with_peer(mut self, peer: Node) -> Self {
        self.peers.push(peer);
        self
    }

    /// Adds peers parsed from `id@host:port` specs.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] for a malformed spec.
    pub fn with_peer_specs<S: AsRef<str>>(mut self, specs: &[S]) -> ClusterResult<Self> {
        for spec in specs {
            let node: Node = spec
                .as_ref()
                .parse()
                .map_err(|e| ClusterError::config(format!("{e}")))?;
            self.peers.push(node);
        }
        Ok(self)
    }

    /// Sets the transaction timeout.
    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    /// Sets the remote call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets identity confirmation attempts and backoff.
    pub fn with_identity_confirmation(mut self, attempts: u32, backoff: Duration) -> Self {
        self.identity_attempts = attempts;
        self.identity_backoff = backoff;
        self
    }

    /// Sets the journal directory.
    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }

    /// Sets the number of admission permits.
    pub fn with_admission_permits(mut self, permits: usize) -> Self {
        self.admission_permits = permits;
        self
    }

    /// Sets the pending queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Sets the submit timeout.
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Sets the background synchronization interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the task retention policy.
    pub fn with_retention(mut self, retention: TaskRetention) -> Self {
        self.retention = retention;
        self
    }

    /// Checks the configuration.
    ///
    /// The journal directory itself is checked when it is opened in
    /// `init`.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] describing the first problem.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(ClusterError::config("cluster name is empty"));
        }

        for (name, value) in [
            ("tx_timeout", self.tx_timeout),
            ("call_timeout", self.call_timeout),
            ("discovery_timeout", self.discovery_timeout),
            ("submit_timeout", self.submit_timeout),
            ("sync_interval", self.sync_interval),
        ] {
            if value.is_zero() {
                return Err(ClusterError::config(format!("{name} must be non-zero")));
            }
        }

        if self.admission_permits == 0 || self.queue_capacity == 0 {
            return Err(ClusterError::config(
                "admission permits and queue capacity must be non-zero",
            ));
        }

        if self.retry.max_attempts == 0 || self.identity_attempts == 0 {
            return Err(ClusterError::config("retry attempts must be non-zero"));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(&peer.id) {
                return Err(ClusterError::config(format!("duplicate peer {}", peer.id)));
            }
            if peer.id == self.local.id && peer.address != self.local.address {
                return Err(ClusterError::config(format!(
                    "peer {peer} conflicts with local node {}",
                    self.local
                )));
            }
        }

        Ok(())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Delay before attempt `attempt` (0-indexed). The first attempt has
    /// no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let delay = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay > 0.0 {
            // Up to 25% on top
            let jitter = delay * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay + jitter)
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Bounds on how long task records stay in the in-memory index.
///
/// Purging only drops the index entry; the journal record stays.
#[derive(Debug, Clone)]
pub struct TaskRetention {
    /// Terminal records kept at most.
    pub max_records: usize,
    /// Terminal records older than this are purged.
    pub max_age: Duration,
    /// Interval between purge passes.
    pub purge_period: Duration,
    /// Delay before the first purge pass.
    pub purge_delay: Duration,
}

impl TaskRetention {
    /// Creates a retention policy.
    pub fn new(max_records: usize, max_age: Duration) -> Self {
        Self {
            max_records,
            max_age,
            ..Self::default()
        }
    }

    /// Sets the purge period and initial delay.
    pub fn with_schedule(mut self, period: Duration, delay: Duration) -> Self {
        self.purge_period = period;
        self.purge_delay = delay;
        self
    }
}

impl Default for TaskRetention {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            max_age: Duration::from_secs(3600),
            purge_period: Duration::from_secs(60),
            purge_delay: Duration::from_secs(60),
        }
    }
}
