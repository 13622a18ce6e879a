//! Task queue of one resource
//!
//! Pure state: no IO and no clocks. The manager feeds in `Instant`s and
//! dispatches whatever [`ResourceScheduler::next_task`] hands out.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::oneshot;

use crate::config::SchedulerConfig;
use crate::models::{CollectionId, ItemId};

/// Outcome reported to a command waiting on a task
pub type TaskOutcome = std::result::Result<(), String>;

/// What a resource is asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Full sync of the tree and every collection
    SyncAll,
    /// Collection tree only
    SyncTree,
    SyncCollection {
        collection: CollectionId,
        parts: BTreeSet<String>,
    },
    /// Deliver missing parts of items a command is waiting on
    FetchItems {
        items: BTreeSet<ItemId>,
        parts: BTreeSet<String>,
    },
    /// Drain the adapter's outbound change log
    ChangeReplay,
}

impl TaskKind {
    /// Queue rank; lower runs first
    fn priority(&self) -> u8 {
        match self {
            TaskKind::FetchItems { .. } => 0,
            TaskKind::ChangeReplay => 1,
            TaskKind::SyncCollection { .. } => 2,
            TaskKind::SyncAll | TaskKind::SyncTree => 3,
        }
    }

    /// Background tasks are dropped when the resource goes offline
    pub fn is_background(&self) -> bool {
        !matches!(self, TaskKind::FetchItems { .. })
    }

    /// Whether `other` asks for nothing this task does not already cover
    fn covers(&self, other: &TaskKind) -> bool {
        match (self, other) {
            (TaskKind::SyncAll, TaskKind::SyncAll | TaskKind::SyncTree) => true,
            (
                TaskKind::SyncCollection { collection, parts },
                TaskKind::SyncCollection {
                    collection: other_collection,
                    parts: other_parts,
                },
            ) => collection == other_collection && other_parts.is_subset(parts),
            (
                TaskKind::FetchItems { items, parts },
                TaskKind::FetchItems {
                    items: other_items,
                    parts: other_parts,
                },
            ) => other_items.is_subset(items) && other_parts.is_subset(parts),
            (a, b) => a == b,
        }
    }

    /// Extend a queued task so it also covers `other`; false if the kinds
    /// cannot be combined
    fn absorb(&mut self, other: &TaskKind) -> bool {
        match (self, other) {
            (
                TaskKind::SyncCollection { collection, parts },
                TaskKind::SyncCollection {
                    collection: other_collection,
                    parts: other_parts,
                },
            ) if collection == other_collection => {
                parts.extend(other_parts.iter().cloned());
                true
            }
            (this @ TaskKind::SyncTree, TaskKind::SyncAll) => {
                *this = TaskKind::SyncAll;
                true
            }
            (this, other) => this.covers(other),
        }
    }

    /// Wire form sent to the adapter after `TASK <serial>`
    pub fn describe(&self) -> String {
        match self {
            TaskKind::SyncAll => "SYNC".to_string(),
            TaskKind::SyncTree => "SYNCTREE".to_string(),
            TaskKind::SyncCollection { collection, .. } => format!("SYNCCOLLECTION {}", collection),
            TaskKind::FetchItems { items, .. } => format!("FETCH {} items", items.len()),
            TaskKind::ChangeReplay => "REPLAY".to_string(),
        }
    }
}

/// Lifecycle state of a resource's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Idle,
    TaskQueued,
    TaskRunning,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Idle => "IDLE",
            ResourceState::TaskQueued => "QUEUED",
            ResourceState::TaskRunning => "RUNNING",
        }
    }
}

/// A task handed to the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub serial: u64,
    pub resource: String,
    pub kind: TaskKind,
}

/// Result of a scheduling request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    Queued(u64),
    /// An equivalent task is already queued or running
    Merged(u64),
    /// Offline resources accept no background work
    Offline,
}

impl Scheduled {
    pub fn serial(&self) -> Option<u64> {
        match self {
            Scheduled::Queued(serial) | Scheduled::Merged(serial) => Some(*serial),
            Scheduled::Offline => None,
        }
    }
}

#[derive(Debug)]
struct QueuedTask {
    serial: u64,
    kind: TaskKind,
    attempts: u32,
    not_before: Option<Instant>,
}

#[derive(Debug)]
struct RunningTask {
    task: QueuedTask,
    last_progress: Instant,
}

/// Queue and state machine for one resource
pub struct ResourceScheduler {
    name: String,
    online: bool,
    queue: VecDeque<QueuedTask>,
    running: Option<RunningTask>,
    waiters: HashMap<u64, Vec<oneshot::Sender<TaskOutcome>>>,
    config: SchedulerConfig,
}

impl ResourceScheduler {
    pub fn new(name: impl Into<String>, online: bool, config: SchedulerConfig) -> Self {
        Self {
            name: name.into(),
            online,
            queue: VecDeque::new(),
            running: None,
            waiters: HashMap::new(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn state(&self) -> ResourceState {
        if self.running.is_some() {
            ResourceState::TaskRunning
        } else if self.queue.is_empty() {
            ResourceState::Idle
        } else {
            ResourceState::TaskQueued
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_kinds(&self) -> Vec<TaskKind> {
        self.queue.iter().map(|t| t.kind.clone()).collect()
    }

    pub fn running_serial(&self) -> Option<u64> {
        self.running.as_ref().map(|r| r.task.serial)
    }

    /// Queue `kind` unless an equivalent task is already queued or running.
    /// `waiter` is told when the task finishes.
    pub fn schedule(
        &mut self,
        kind: TaskKind,
        serial: u64,
        waiter: Option<oneshot::Sender<TaskOutcome>>,
    ) -> Scheduled {
        if !self.online {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(format!("Resource {} is offline", self.name)));
            }
            return Scheduled::Offline;
        }

        let merged = match &self.running {
            Some(running) if running.task.kind.covers(&kind) => Some(running.task.serial),
            _ => self
                .queue
                .iter_mut()
                .find_map(|queued| queued.kind.absorb(&kind).then_some(queued.serial)),
        };
        if let Some(existing) = merged {
            debug!("{}: merged {} into task {}", self.name, kind.describe(), existing);
            if let Some(waiter) = waiter {
                self.waiters.entry(existing).or_default().push(waiter);
            }
            return Scheduled::Merged(existing);
        }

        debug!("{}: queued task {} {}", self.name, serial, kind.describe());
        let position = self
            .queue
            .iter()
            .position(|queued| queued.kind.priority() > kind.priority())
            .unwrap_or(self.queue.len());
        self.queue.insert(
            position,
            QueuedTask {
                serial,
                kind,
                attempts: 0,
                not_before: None,
            },
        );
        if let Some(waiter) = waiter {
            self.waiters.entry(serial).or_default().push(waiter);
        }
        Scheduled::Queued(serial)
    }

    /// Start the best ready task when nothing is running
    pub fn next_task(&mut self, now: Instant) -> Option<TaskRequest> {
        if self.running.is_some() || !self.online {
            return None;
        }
        let position = self
            .queue
            .iter()
            .position(|queued| queued.not_before.is_none_or(|at| at <= now))?;
        let task = self.queue.remove(position)?;
        let request = TaskRequest {
            serial: task.serial,
            resource: self.name.clone(),
            kind: task.kind.clone(),
        };
        self.running = Some(RunningTask {
            task,
            last_progress: now,
        });
        Some(request)
    }

    /// Record progress of the running task; false for an unknown serial
    pub fn heartbeat(&mut self, serial: u64, now: Instant) -> bool {
        match &mut self.running {
            Some(running) if running.task.serial == serial => {
                running.last_progress = now;
                true
            }
            _ => false,
        }
    }

    /// Finish the running task. Failed background tasks are retried with
    /// backoff until the retry limit.
    pub fn complete(&mut self, serial: u64, error: Option<String>, now: Instant) -> bool {
        let Some(running) = self.running.take_if(|r| r.task.serial == serial) else {
            return false;
        };
        match error {
            None => {
                debug!("{}: task {} done", self.name, serial);
                self.finish(serial, Ok(()));
            }
            Some(error) => self.fail(running.task, error, now),
        }
        true
    }

    /// Fail the running task if it has not shown progress for the allowed
    /// number of heartbeat intervals; returns its serial
    pub fn check_watchdog(&mut self, now: Instant) -> Option<u64> {
        let limit = self.config.heartbeat_interval() * self.config.missed_heartbeats.max(1);
        let stalled = self
            .running
            .as_ref()
            .is_some_and(|r| now.saturating_duration_since(r.last_progress) > limit);
        if !stalled {
            return None;
        }
        let running = self.running.take()?;
        let serial = running.task.serial;
        warn!("{}: task {} missed its heartbeats", self.name, serial);
        self.fail(running.task, "Task timed out".to_string(), now);
        Some(serial)
    }

    /// The adapter went away; its running task counts as failed
    pub fn adapter_lost(&mut self, now: Instant) -> Option<u64> {
        let running = self.running.take()?;
        let serial = running.task.serial;
        self.fail(running.task, format!("Resource {} disconnected", self.name), now);
        Some(serial)
    }

    /// Switch online state. Going offline drops queued background tasks and
    /// fails waiting fetches; a running task is left to finish. Returns the
    /// number of dropped tasks.
    pub fn set_online(&mut self, online: bool) -> usize {
        if self.online == online {
            return 0;
        }
        self.online = online;
        if online {
            info!("{}: online", self.name);
            return 0;
        }

        let dropped: Vec<QueuedTask> = self.queue.drain(..).collect();
        for task in &dropped {
            self.finish(task.serial, Err(format!("Resource {} went offline", self.name)));
        }
        info!("{}: offline, dropped {} queued tasks", self.name, dropped.len());
        dropped.len()
    }

    /// Earliest time a backed-off task becomes ready
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.queue.iter().filter_map(|t| t.not_before).min()
    }

    fn fail(&mut self, mut task: QueuedTask, error: String, now: Instant) {
        task.attempts += 1;
        if self.online && task.kind.is_background() && task.attempts < self.config.max_retries {
            let delay = backoff_delay(&self.config, task.attempts);
            warn!(
                "{}: task {} failed ({}), retry {} in {:?}",
                self.name, task.serial, error, task.attempts, delay
            );
            task.not_before = Some(now + delay);
            let position = self
                .queue
                .iter()
                .position(|queued| queued.kind.priority() > task.kind.priority())
                .unwrap_or(self.queue.len());
            self.queue.insert(position, task);
        } else {
            warn!("{}: task {} failed: {}", self.name, task.serial, error);
            self.finish(task.serial, Err(error));
        }
    }

    fn finish(&mut self, serial: u64, outcome: TaskOutcome) {
        for waiter in self.waiters.remove(&serial).unwrap_or_default() {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at the maximum
pub fn backoff_delay(config: &SchedulerConfig, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.saturating_sub(1).min(20);
    Duration::from_secs(
        config
            .backoff_base_secs
            .saturating_mul(factor)
            .min(config.backoff_max_secs),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> ResourceScheduler {
        ResourceScheduler::new("imap", true, SchedulerConfig::default())
    }

    fn sync_collection(id: i64, parts: &[&str]) -> TaskKind {
        TaskKind::SyncCollection {
            collection: CollectionId(id),
            parts: parts.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_duplicate_sync_is_merged() {
        let mut s = scheduler();
        assert_eq!(s.schedule(TaskKind::SyncAll, 1, None), Scheduled::Queued(1));
        assert_eq!(s.schedule(TaskKind::SyncAll, 2, None), Scheduled::Merged(1));
        assert_eq!(s.queued(), 1);
        assert_eq!(s.state(), ResourceState::TaskQueued);
    }

    #[test]
    fn test_sync_while_running_is_merged() {
        let mut s = scheduler();
        let now = Instant::now();
        s.schedule(TaskKind::SyncAll, 1, None);
        assert_eq!(s.next_task(now).unwrap().serial, 1);
        assert_eq!(s.schedule(TaskKind::SyncTree, 2, None), Scheduled::Merged(1));
        assert_eq!(s.queued(), 0);
        assert_eq!(s.state(), ResourceState::TaskRunning);
    }

    #[test]
    fn test_collection_sync_parts_are_merged() {
        let mut s = scheduler();
        s.schedule(sync_collection(4, &["PLD:HEAD"]), 1, None);
        assert_eq!(
            s.schedule(sync_collection(4, &["PLD:RFC822"]), 2, None),
            Scheduled::Merged(1)
        );
        assert_eq!(s.queued_kinds(), vec![sync_collection(4, &["PLD:HEAD", "PLD:RFC822"])]);
        assert_eq!(s.schedule(sync_collection(5, &[]), 3, None), Scheduled::Queued(3));
    }

    #[test]
    fn test_fetch_preempts_background_and_replay_precedes_sync() {
        let mut s = scheduler();
        let now = Instant::now();
        s.schedule(TaskKind::SyncAll, 1, None);
        s.schedule(sync_collection(3, &[]), 2, None);
        s.schedule(TaskKind::ChangeReplay, 3, None);
        s.schedule(
            TaskKind::FetchItems {
                items: [ItemId(9)].into(),
                parts: BTreeSet::new(),
            },
            4,
            None,
        );

        let order: Vec<u64> = std::iter::from_fn(|| {
            let task = s.next_task(now)?;
            s.complete(task.serial, None, now);
            Some(task.serial)
        })
        .collect();
        assert_eq!(order, vec![4, 3, 2, 1]);
        assert_eq!(s.state(), ResourceState::Idle);
    }

    #[test]
    fn test_one_task_at_a_time() {
        let mut s = scheduler();
        let now = Instant::now();
        s.schedule(TaskKind::SyncTree, 1, None);
        s.schedule(TaskKind::ChangeReplay, 2, None);
        assert!(s.next_task(now).is_some());
        assert!(s.next_task(now).is_none());
    }

    #[test]
    fn test_offline_drops_queued_but_keeps_running() {
        let mut s = scheduler();
        let now = Instant::now();
        s.schedule(TaskKind::SyncTree, 1, None);
        s.next_task(now);
        let (tx, mut rx) = oneshot::channel();
        s.schedule(sync_collection(2, &[]), 2, Some(tx));

        assert_eq!(s.set_online(false), 1);
        assert_eq!(s.queued(), 0);
        assert_eq!(s.running_serial(), Some(1));
        assert!(rx.try_recv().unwrap().is_err());
        assert_eq!(s.schedule(TaskKind::SyncAll, 3, None), Scheduled::Offline);

        assert!(s.complete(1, None, now));
        assert_eq!(s.state(), ResourceState::Idle);
    }

    #[test]
    fn test_watchdog_fails_and_backs_off() {
        let mut s = scheduler();
        let start = Instant::now();
        s.schedule(TaskKind::SyncAll, 1, None);
        s.next_task(start);

        let interval = SchedulerConfig::default().heartbeat_interval();
        assert!(s.heartbeat(1, start + interval));
        assert_eq!(s.check_watchdog(start + interval * 2), None);

        let late = start + interval * 10;
        assert_eq!(s.check_watchdog(late), Some(1));
        assert_eq!(s.state(), ResourceState::TaskQueued);
        // backed off: not ready yet
        assert!(s.next_task(late).is_none());
        let ready = s.next_wakeup().unwrap();
        assert_eq!(s.next_task(ready).unwrap().serial, 1);
    }

    #[test]
    fn test_fetch_failure_reaches_waiter() {
        let mut s = scheduler();
        let now = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let kind = TaskKind::FetchItems {
            items: [ItemId(1)].into(),
            parts: BTreeSet::new(),
        };
        s.schedule(kind, 1, Some(tx));
        s.next_task(now);
        s.complete(1, Some("no such message".into()), now);
        assert_eq!(rx.try_recv().unwrap(), Err("no such message".to_string()));
        assert_eq!(s.queued(), 0);
    }

    #[test]
    fn test_retry_limit() {
        let config = SchedulerConfig {
            max_retries: 2,
            ..Default::default()
        };
        let mut s = ResourceScheduler::new("dav", true, config);
        let mut now = Instant::now();
        s.schedule(TaskKind::SyncTree, 1, None);
        for _ in 0..2 {
            now += Duration::from_secs(3600);
            let task = s.next_task(now).unwrap();
            s.complete(task.serial, Some("boom".into()), now);
        }
        assert_eq!(s.state(), ResourceState::Idle);
    }

    #[test]
    fn test_backoff_delay() {
        let config = SchedulerConfig {
            backoff_base_secs: 5,
            backoff_max_secs: 60,
            ..Default::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(60));
    }
}
