//! The worker registry.
//!
//! One owned structure holds every piece of per-bot state: worker records,
//! start locks, scan trackers, per-bot operation locks, and the restart
//! policy. The supervisor keeps it behind a single async mutex, so a purge
//! removes all of a bot's bookkeeping in one critical section.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{BotId, ConfigSnapshot, Error, IngestionMode, Result, WorkerStatus};
use fleet_ipc::{ControllerMessage, LogLevel};
use fleet_reconciler::{ActualState, ObservedWorker};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::policy::RestartPolicy;
use crate::process::ExitInfo;
use crate::scanner::Verdict;

/// One log line received from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub level: &'static str,
    pub line: String,
}

/// Fixed-capacity ring buffer of worker log lines.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
}

impl LogBuffer {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, level: LogLevel, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            at: Utc::now(),
            level: level.as_str(),
            line,
        });
    }

    /// The last `n` lines, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Why the supervisor is taking a worker down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopIntent {
    /// No supervisor-issued stop. An exit now is unexpected.
    #[default]
    None,
    /// Stop and forget the bot.
    Stop,
    /// Stop as the first half of a restart.
    Restart,
}

/// Outcome of a hot reload, as acknowledged by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadAck {
    pub applied: bool,
    pub error: Option<String>,
}

/// A hot reload waiting for the worker's ack.
#[derive(Debug)]
pub struct PendingReload {
    pub revision: u64,
    pub reply: oneshot::Sender<ReloadAck>,
}

/// Live connection to a worker process.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub pid: u32,
    pub outbox: mpsc::Sender<ControllerMessage>,
    /// Resolves to `Some` once the process has exited.
    pub exited: watch::Receiver<Option<ExitInfo>>,
}

/// Supervisor's belief about one bot's worker.
#[derive(Debug)]
pub struct WorkerRecord {
    pub bot_id: BotId,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub last_heartbeat: Option<Instant>,
    /// When the worker last became `running`.
    pub running_since: Option<Instant>,
    pub rss_bytes: Option<u64>,
    pub snapshot: ConfigSnapshot,
    pub stop_intent: StopIntent,
    pub last_exit: Option<ExitInfo>,
    pub handle: Option<WorkerHandle>,
    pub logs: LogBuffer,
    pub pending_reload: Option<PendingReload>,
}

impl WorkerRecord {
    /// New record in `stopped`, ready to move to `starting`.
    #[must_use]
    pub fn new(bot_id: BotId, snapshot: ConfigSnapshot, log_capacity: usize) -> Self {
        Self {
            bot_id,
            pid: None,
            status: WorkerStatus::Stopped,
            started_at: Utc::now(),
            started: Instant::now(),
            last_heartbeat: None,
            running_since: None,
            rss_bytes: None,
            snapshot,
            stop_intent: StopIntent::None,
            last_exit: None,
            handle: None,
            logs: LogBuffer::new(log_capacity),
            pending_reload: None,
        }
    }

    /// Move along the lifecycle state machine.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` for an edge the state machine forbids.
    pub fn transition(&mut self, to: WorkerStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::invalid_transition(self.bot_id, self.status, to));
        }
        debug!(bot_id = %self.bot_id, from = %self.status, to = %to, "Worker transition");
        self.status = to;
        match to {
            WorkerStatus::Starting => {
                self.started_at = Utc::now();
                self.started = Instant::now();
                self.running_since = None;
                self.last_heartbeat = None;
            }
            WorkerStatus::Running => self.running_since = Some(Instant::now()),
            WorkerStatus::Crashed | WorkerStatus::Stopped => self.running_since = None,
            WorkerStatus::Stopping => {}
        }
        Ok(())
    }

    /// Time since the last liveness signal, or since start if none arrived.
    #[must_use]
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat.unwrap_or(self.started))
    }

    /// A process, piped or adopted, is believed to belong to this record.
    #[must_use]
    pub const fn has_process(&self) -> bool {
        self.pid.is_some()
    }
}

/// Scanner bookkeeping for one bot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessTracker {
    pub observed_pids: BTreeSet<u32>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_verdict: Option<Verdict>,
    pub restart_in_progress: bool,
}

/// All per-bot state of the controller.
#[derive(Debug)]
pub struct Registry {
    workers: BTreeMap<BotId, WorkerRecord>,
    /// Start lock expiry per bot.
    start_locks: HashMap<BotId, Instant>,
    trackers: BTreeMap<BotId, ProcessTracker>,
    op_locks: HashMap<BotId, Arc<Mutex<()>>>,
    pub policy: RestartPolicy,
    mode: IngestionMode,
}

impl Registry {
    #[must_use]
    pub fn new(policy: RestartPolicy, mode: IngestionMode) -> Self {
        Self {
            workers: BTreeMap::new(),
            start_locks: HashMap::new(),
            trackers: BTreeMap::new(),
            op_locks: HashMap::new(),
            policy,
            mode,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> IngestionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: IngestionMode) {
        self.mode = mode;
    }

    #[must_use]
    pub fn get(&self, bot_id: BotId) -> Option<&WorkerRecord> {
        self.workers.get(&bot_id)
    }

    pub fn get_mut(&mut self, bot_id: BotId) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&bot_id)
    }

    pub fn insert(&mut self, record: WorkerRecord) {
        self.workers.insert(record.bot_id, record);
    }

    pub fn remove(&mut self, bot_id: BotId) -> Option<WorkerRecord> {
        self.workers.remove(&bot_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    pub fn workers_mut(&mut self) -> impl Iterator<Item = &mut WorkerRecord> {
        self.workers.values_mut()
    }

    #[must_use]
    pub fn bot_ids(&self) -> Vec<BotId> {
        self.workers.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers that own or are about to own a process.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|w| w.status.is_live()).count()
    }

    #[must_use]
    pub fn find_by_pid(&self, pid: u32) -> Option<BotId> {
        self.workers
            .values()
            .find(|w| w.pid == Some(pid))
            .map(|w| w.bot_id)
    }

    /// Take the start lock. `false` when an unexpired lock is held.
    pub fn acquire_start_lock(&mut self, bot_id: BotId, grace: Duration, now: Instant) -> bool {
        if self.is_start_locked(bot_id, now) {
            return false;
        }
        self.start_locks.insert(bot_id, now + grace);
        true
    }

    pub fn release_start_lock(&mut self, bot_id: BotId) -> bool {
        self.start_locks.remove(&bot_id).is_some()
    }

    #[must_use]
    pub fn is_start_locked(&self, bot_id: BotId, now: Instant) -> bool {
        self.start_locks.get(&bot_id).is_some_and(|until| now < *until)
    }

    #[must_use]
    pub fn start_lock_remaining(&self, bot_id: BotId, now: Instant) -> Option<Duration> {
        self.start_locks
            .get(&bot_id)
            .filter(|until| now < **until)
            .map(|until| until.saturating_duration_since(now))
    }

    /// Drop expired start locks and return their bots.
    pub fn expire_start_locks(&mut self, now: Instant) -> Vec<BotId> {
        let expired: Vec<BotId> = self
            .start_locks
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(id, _)| *id)
            .collect();
        for bot_id in &expired {
            self.start_locks.remove(bot_id);
        }
        expired
    }

    #[must_use]
    pub fn tracker(&self, bot_id: BotId) -> Option<&ProcessTracker> {
        self.trackers.get(&bot_id)
    }

    pub fn tracker_mut(&mut self, bot_id: BotId) -> &mut ProcessTracker {
        self.trackers.entry(bot_id).or_default()
    }

    /// Lock serializing lifecycle operations on one bot.
    pub fn op_lock(&mut self, bot_id: BotId) -> Arc<Mutex<()>> {
        Arc::clone(self.op_locks.entry(bot_id).or_default())
    }

    /// A lifecycle operation currently holds the bot's lock.
    #[must_use]
    pub fn is_busy(&self, bot_id: BotId) -> bool {
        self.op_locks
            .get(&bot_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// A start is in flight: start lock held or an operation running.
    ///
    /// A `starting` record alone does not count. Once the grace window has
    /// passed, a worker that never reported in is fair game for a restart.
    #[must_use]
    pub fn is_starting(&self, bot_id: BotId, now: Instant) -> bool {
        self.is_start_locked(bot_id, now) || self.is_busy(bot_id)
    }

    /// Forget an idle bot's operation lock once nothing references it.
    pub fn release_op_lock(&mut self, bot_id: BotId) {
        if !self.workers.contains_key(&bot_id)
            && self
                .op_locks
                .get(&bot_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            self.op_locks.remove(&bot_id);
        }
    }

    /// Remove a bot's record together with every piece of bookkeeping.
    pub fn purge(&mut self, bot_id: BotId) -> Option<WorkerRecord> {
        self.start_locks.remove(&bot_id);
        self.trackers.remove(&bot_id);
        self.policy.purge(bot_id);
        if self
            .op_locks
            .get(&bot_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            self.op_locks.remove(&bot_id);
        }
        self.workers.remove(&bot_id)
    }

    /// Drop everything. Used by nuclear cleanup.
    pub fn clear(&mut self) -> Vec<BotId> {
        let ids = self.bot_ids();
        for bot_id in &ids {
            self.purge(*bot_id);
        }
        self.start_locks.clear();
        self.trackers.clear();
        ids
    }

    /// The registry as seen by the synchronizer.
    ///
    /// A crashed worker the policy would refuse right now counts as pending,
    /// so a pass inside its cooldown plans nothing for it.
    #[must_use]
    pub fn observe(&self, now: Instant) -> ActualState {
        let mut actual = ActualState::new();
        for worker in self.workers.values() {
            let held_back = worker.status == WorkerStatus::Crashed
                && self.policy.is_held_back(worker.bot_id, now);
            actual.update(ObservedWorker {
                bot_id: worker.bot_id,
                status: worker.status,
                snapshot: worker.snapshot.clone(),
                restart_pending: self.policy.is_queued(worker.bot_id)
                    || self.is_busy(worker.bot_id)
                    || held_back,
            });
        }
        actual
    }
}
