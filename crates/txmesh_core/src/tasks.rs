//! Task lifecycle tracking and retention.

use crate::config::TaskRetention;
use crate::error::{ClusterError, ClusterResult};
use crate::events::{ClusterEvent, EventBus};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use txmesh_protocol::{JournalRecord, Request, ResourceId, TaskId, TaskStatus, TxId};

/// Read-only view of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// Client-visible task id.
    pub task_id: TaskId,
    /// Target resource manager.
    pub resource: ResourceId,
    /// Transaction id, once assigned.
    pub tx_id: Option<TxId>,
    /// Current status.
    pub status: TaskStatus,
    /// Every status the task went through, oldest first.
    pub history: Vec<TaskStatus>,
    /// Failure description, if any.
    pub message: Option<String>,
}

impl TaskRecord {
    /// Rebuilds a record from a journal entry after its index entry was
    /// purged.
    #[must_use]
    pub fn from_journal(resource: ResourceId, record: &JournalRecord) -> Self {
        let status = if record.is_committed() {
            TaskStatus::Committed
        } else {
            TaskStatus::RolledBack
        };
        Self {
            task_id: record.task_id(),
            resource,
            tx_id: Some(record.tx_id()),
            status,
            history: vec![status],
            message: None,
        }
    }
}

struct Tracked {
    record: TaskRecord,
    updated: Instant,
}

/// Index of submitted tasks.
pub struct TaskTracker {
    tasks: RwLock<HashMap<TaskId, Tracked>>,
    retention: TaskRetention,
    events: Arc<EventBus>,
}

impl TaskTracker {
    /// Creates an empty tracker.
    pub fn new(retention: TaskRetention, events: Arc<EventBus>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            retention,
            events,
        }
    }

    /// Records a freshly queued request as `PENDING`.
    pub fn insert(&self, request: &Request) {
        let record = TaskRecord {
            task_id: request.task_id,
            resource: request.resource.clone(),
            tx_id: None,
            status: TaskStatus::Pending,
            history: vec![TaskStatus::Pending],
            message: None,
        };
        self.tasks.write().insert(
            request.task_id,
            Tracked {
                record,
                updated: Instant::now(),
            },
        );
    }

    /// Assigns the transaction id.
    pub fn assign(&self, task_id: TaskId, tx_id: TxId) {
        if let Some(tracked) = self.tasks.write().get_mut(&task_id) {
            tracked.record.tx_id = Some(tx_id);
            tracked.updated = Instant::now();
        }
    }

    /// Moves a task to `status`. Illegal transitions are ignored.
    ///
    /// Returns true if the status changed.
    pub fn update(&self, task_id: TaskId, status: TaskStatus, message: Option<String>) -> bool {
        let resource = {
            let mut tasks = self.tasks.write();
            let Some(tracked) = tasks.get_mut(&task_id) else {
                debug!(task = %task_id, %status, "status update for untracked task");
                return false;
            };
            let current = tracked.record.status;
            if !current.can_transition_to(status) {
                debug!(task = %task_id, %current, %status, "ignoring task status regression");
                return false;
            }
            tracked.record.status = status;
            tracked.record.history.push(status);
            if message.is_some() {
                tracked.record.message = message;
            }
            tracked.updated = Instant::now();
            tracked.record.resource.clone()
        };

        if status.is_done() {
            self.events.publish(ClusterEvent::TaskCompleted {
                task_id,
                resource,
                status,
            });
        }
        true
    }

    /// Looks a task up in the index.
    pub fn get(&self, task_id: TaskId) -> Option<TaskRecord> {
        self.tasks.read().get(&task_id).map(|t| t.record.clone())
    }

    /// All indexed tasks.
    pub fn list(&self) -> Vec<TaskRecord> {
        self.tasks
            .read()
            .values()
            .map(|t| t.record.clone())
            .collect()
    }

    /// Indexed tasks targeting one resource manager.
    pub fn for_resource(&self, resource: &ResourceId) -> Vec<TaskRecord> {
        self.tasks
            .read()
            .values()
            .filter(|t| &t.record.resource == resource)
            .map(|t| t.record.clone())
            .collect()
    }

    /// Number of indexed tasks.
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops terminal records older than `max_age`, then the oldest
    /// terminal records beyond `max_records`. Returns how many were
    /// dropped. Journal records are untouched.
    pub fn purge(&self, now: Instant) -> usize {
        let mut tasks = self.tasks.write();
        let before = tasks.len();

        tasks.retain(|_, t| {
            !(t.record.status.is_done()
                && now.saturating_duration_since(t.updated) > self.retention.max_age)
        });

        let mut done: Vec<(Instant, TaskId)> = tasks
            .iter()
            .filter(|(_, t)| t.record.status.is_done())
            .map(|(id, t)| (t.updated, *id))
            .collect();
        if done.len() > self.retention.max_records {
            done.sort();
            let excess = done.len() - self.retention.max_records;
            for (_, id) in done.into_iter().take(excess) {
                tasks.remove(&id);
            }
        }

        before - tasks.len()
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Background thread running [`TaskTracker::purge`] on the retention
/// schedule.
pub(crate) struct TaskPurger {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl TaskPurger {
    pub fn start(tracker: Arc<TaskTracker>) -> ClusterResult<Self> {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let delay = tracker.retention.purge_delay;
        let period = tracker.retention.purge_period.max(Duration::from_millis(1));

        let handle = thread::Builder::new()
            .name("txmesh-task-purge".to_string())
            .spawn(move || {
                let mut wait = delay;
                loop {
                    {
                        let mut stopped = thread_signal.stopped.lock();
                        if !*stopped {
                            thread_signal.cv.wait_for(&mut stopped, wait);
                        }
                        if *stopped {
                            return;
                        }
                    }
                    let purged = tracker.purge(Instant::now());
                    if purged > 0 {
                        info!(purged, remaining = tracker.len(), "purged task records");
                    }
                    wait = period;
                }
            })
            .map_err(|_| ClusterError::Spawn("task purge"))?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("task purge thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_records: usize, max_age: Duration) -> TaskTracker {
        TaskTracker::new(
            TaskRetention::new(max_records, max_age),
            Arc::new(EventBus::new(1, 1)),
        )
    }

    fn submit(tracker: &TaskTracker) -> TaskId {
        let request = Request::new(ResourceId::from("blocks"), vec![1]);
        tracker.insert(&request);
        request.task_id
    }

    #[test]
    fn lifecycle_history() {
        let tracker = tracker(10, Duration::from_secs(60));
        let id = submit(&tracker);
        tracker.assign(id, TxId::new(4));

        assert!(tracker.update(id, TaskStatus::Started, None));
        assert!(tracker.update(id, TaskStatus::Prepared, None));
        assert!(tracker.update(id, TaskStatus::Committed, None));
        // No way back from a terminal status
        assert!(!tracker.update(id, TaskStatus::RolledBack, None));

        let record = tracker.get(id).unwrap();
        assert_eq!(record.tx_id, Some(TxId::new(4)));
        assert_eq!(
            record.history,
            vec![
                TaskStatus::Pending,
                TaskStatus::Started,
                TaskStatus::Prepared,
                TaskStatus::Committed
            ]
        );
    }

    #[test]
    fn lookup_by_resource() {
        let tracker = tracker(10, Duration::from_secs(60));
        submit(&tracker);
        let other = Request::new(ResourceId::from("meta"), vec![]);
        tracker.insert(&other);

        assert_eq!(tracker.for_resource(&ResourceId::from("blocks")).len(), 1);
        assert_eq!(tracker.for_resource(&ResourceId::from("meta")).len(), 1);
        assert_eq!(tracker.list().len(), 2);
    }

    #[test]
    fn purge_by_age_keeps_open_tasks() {
        let tracker = tracker(10, Duration::from_millis(10));
        let done = submit(&tracker);
        let open = submit(&tracker);
        tracker.update(done, TaskStatus::RolledBack, Some("cancelled".into()));

        let purged = tracker.purge(Instant::now() + Duration::from_secs(1));
        assert_eq!(purged, 1);
        assert!(tracker.get(done).is_none());
        assert!(tracker.get(open).is_some());
    }

    #[test]
    fn purge_by_volume_drops_oldest() {
        let tracker = tracker(2, Duration::from_secs(3600));
        let ids: Vec<TaskId> = (0..4).map(|_| submit(&tracker)).collect();
        for id in &ids {
            tracker.update(*id, TaskStatus::RolledBack, None);
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(tracker.purge(Instant::now()), 2);
        assert!(tracker.get(ids[0]).is_none());
        assert!(tracker.get(ids[1]).is_none());
        assert!(tracker.get(ids[3]).is_some());
    }

    #[test]
    fn purger_runs_on_schedule() {
        let tracker = Arc::new(TaskTracker::new(
            TaskRetention::new(0, Duration::from_secs(3600))
                .with_schedule(Duration::from_millis(10), Duration::from_millis(10)),
            Arc::new(EventBus::new(1, 1)),
        ));
        let id = submit(&tracker);
        tracker.update(id, TaskStatus::RolledBack, None);

        let purger = TaskPurger::start(Arc::clone(&tracker)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !tracker.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        purger.stop();
        assert!(tracker.is_empty());
    }

    #[test]
    fn journal_fallback_record() {
        let record = JournalRecord::RolledBack {
            tx_id: TxId::new(2),
            task_id: TaskId::generate(),
        };
        let rebuilt = TaskRecord::from_journal(ResourceId::from("blocks"), &record);
        assert_eq!(rebuilt.status, TaskStatus::RolledBack);
        assert_eq!(rebuilt.tx_id, Some(TxId::new(2)));
    }
}
