//! Cluster event bus.
//!
//! Each subscriber gets its own delivery thread fed by an `mpsc` channel,
//! so events reach one listener in the order they were published. A
//! listener that returns `Err` gets the same event again, a bounded number
//! of times; after that the event is parked in the dead-letter log and
//! delivery moves on.

use crate::error::{ClusterError, ClusterResult};
use crate::status::{ClusterStatus, SyncState};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, warn};
use txmesh_protocol::{Node, ResourceId, TaskId, TaskStatus};

const REDELIVERY_DELAY: Duration = Duration::from_millis(20);

/// Notification published by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// The coordinator lifecycle state changed.
    NodeStatusChanged {
        /// Previous state.
        from: ClusterStatus,
        /// New state.
        to: ClusterStatus,
    },
    /// A peer was added to the registered set.
    PeerRegistered(Node),
    /// A peer was removed from the registered set.
    PeerUnregistered(Node),
    /// A registered peer came online.
    PeerOnline {
        /// The peer.
        node: Node,
        /// Quorum after the change.
        quorum: bool,
    },
    /// A peer went offline.
    PeerOffline {
        /// The peer.
        node: Node,
        /// Quorum after the change.
        quorum: bool,
    },
    /// A resource manager changed synchronization state.
    ResMgrStateChanged {
        /// Resource manager id.
        resource: ResourceId,
        /// Previous state.
        from: SyncState,
        /// New state.
        to: SyncState,
    },
    /// A task reached a terminal status.
    TaskCompleted {
        /// Task id.
        task_id: TaskId,
        /// Target resource manager.
        resource: ResourceId,
        /// Terminal status.
        status: TaskStatus,
    },
}

/// Result returned by listeners.
pub type ListenerResult = Result<(), String>;

/// Receives cluster events.
pub trait ClusterListener: Send + Sync {
    /// Called once per event, on the subscriber's delivery thread.
    ///
    /// Returning `Err` asks for redelivery.
    fn on_event(&self, event: &ClusterEvent) -> ListenerResult;
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An event that could not be delivered.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Subscriber the event was meant for.
    pub subscription: SubscriptionId,
    /// The event.
    pub event: ClusterEvent,
    /// Last listener error.
    pub error: String,
    /// Delivery attempts made.
    pub attempts: u32,
}

struct Subscriber {
    sender: Sender<ClusterEvent>,
    handle: Option<JoinHandle<()>>,
}

/// Ordered, at-least-once publish/subscribe.
pub struct EventBus {
    subscribers: Mutex<BTreeMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    attempts: u32,
    dead_letter_capacity: usize,
}

impl EventBus {
    /// Creates a bus.
    ///
    /// `attempts` is the number of deliveries tried per event and
    /// subscriber; `dead_letter_capacity` bounds the dead-letter log.
    pub fn new(attempts: u32, dead_letter_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            dead_letters: Arc::new(Mutex::new(VecDeque::new())),
            attempts: attempts.max(1),
            dead_letter_capacity,
        }
    }

    /// Subscribes a listener.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Spawn`] if the delivery thread cannot start.
    pub fn subscribe(&self, listener: Arc<dyn ClusterListener>) -> ClusterResult<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = mpsc::channel();

        let delivery = Delivery {
            id,
            listener,
            attempts: self.attempts,
            dead_letters: Arc::clone(&self.dead_letters),
            capacity: self.dead_letter_capacity,
        };
        let handle = thread::Builder::new()
            .name(format!("txmesh-events-{}", id.0))
            .spawn(move || delivery.run(receiver))
            .map_err(|_| ClusterError::Spawn("event delivery"))?;

        self.subscribers.lock().insert(
            id,
            Subscriber {
                sender,
                handle: Some(handle),
            },
        );
        Ok(id)
    }

    /// Removes a subscriber after it drained the events already posted.
    ///
    /// Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some(subscriber) = self.subscribers.lock().remove(&id) else {
            return false;
        };
        Self::finish(subscriber);
        true
    }

    fn finish(mut subscriber: Subscriber) {
        drop(subscriber.sender);
        if let Some(handle) = subscriber.handle.take() {
            // A listener unsubscribing itself must not join its own thread
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Posts an event to every subscriber.
    pub fn publish(&self, event: ClusterEvent) {
        let subscribers = self.subscribers.lock();
        for (id, subscriber) in subscribers.iter() {
            if subscriber.sender.send(event.clone()).is_err() {
                warn!(subscription = %id, "event delivery thread is gone");
            }
        }
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Snapshot of the dead-letter log, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    /// Drops every subscriber, draining what was already posted.
    pub fn shutdown(&self) {
        let subscribers: Vec<Subscriber> = {
            let mut guard = self.subscribers.lock();
            std::mem::take(&mut *guard).into_values().collect()
        };
        for subscriber in subscribers {
            Self::finish(subscriber);
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Delivery {
    id: SubscriptionId,
    listener: Arc<dyn ClusterListener>,
    attempts: u32,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    capacity: usize,
}

impl Delivery {
    fn run(self, receiver: Receiver<ClusterEvent>) {
        for event in receiver {
            self.deliver(event);
        }
    }

    fn deliver(&self, event: ClusterEvent) {
        let mut last_error = String::new();
        for attempt in 0..self.attempts {
            if attempt > 0 {
                thread::sleep(REDELIVERY_DELAY);
            }
            match self.listener.on_event(&event) {
                Ok(()) => return,
                Err(e) => last_error = e,
            }
        }

        warn!(
            subscription = %self.id,
            attempts = self.attempts,
            error = %last_error,
            ?event,
            "event undeliverable, moved to dead letters"
        );

        if self.capacity == 0 {
            error!(subscription = %self.id, "dead-letter log disabled, event dropped");
            return;
        }
        let mut dead = self.dead_letters.lock();
        while dead.len() >= self.capacity {
            dead.pop_front();
        }
        dead.push_back(DeadLetter {
            subscription: self.id,
            event,
            error: last_error,
            attempts: self.attempts,
        });
    }
}
