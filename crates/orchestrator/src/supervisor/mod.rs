//! Worker Supervisor.
//!
//! Owns the worker lifecycle: spawn, graceful stop with escalation, restart,
//! and the registry that records what the controller believes is running.
//!
//! Every lifecycle operation on a bot takes that bot's operation lock from
//! the registry, so a start, stop, restart, or hot reload for one bot never
//! overlaps another for the same bot. Different bots proceed in parallel.
//!
//! ```text
//! start:   op lock -> start lock -> spawn -> attach IPC tasks
//! stop:    cancel queued restart -> op lock -> Shutdown msg -> SIGTERM
//!          -> SIGKILL -> sweep tagged pids -> purge bookkeeping
//! restart: op lock -> stop (history kept) -> start
//! ```

mod dispatch;
mod operations;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{BotId, DesiredBotConfig, Error, IngestionMode, Result, ResultExt, WorkerStatus};
use fleet_ipc::ControllerMessage;
use fleet_reconciler::{ActionExecutor, ActualState, ActualStateProvider, ReconcileAction};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::control_plane::AssistantMetadataSource;
use crate::policy::{RestartDecision, RestartPolicy, RestartReason};
use crate::process::{ExitInfo, ProcessManager, SpawnRequest, WorkerSignal};
use crate::registry::{Registry, StopIntent, WorkerHandle, WorkerRecord};

pub use operations::{
    CacheClearReport, CleanupReport, FailedRestart, HotReloadOutcome, ModeSwitchReport,
    NuclearReport, RestartAllReport,
};

/// Environment variable carrying the ingestion mode.
pub const MODE_ENV: &str = "FLEET_INGESTION_MODE";
/// Environment variable carrying the external platform token.
pub const TOKEN_ENV: &str = "FLEET_EXTERNAL_TOKEN";
/// Environment variable carrying the external assistant id.
pub const ASSISTANT_ENV: &str = "FLEET_EXTERNAL_ASSISTANT_ID";
/// Environment variable carrying the mutable settings as JSON.
pub const SETTINGS_ENV: &str = "FLEET_BOT_SETTINGS";

/// Fleet-wide operations run at most this many bots at once.
pub const FLEET_CONCURRENCY: usize = 16;

const DETACHED_POLL: Duration = Duration::from_millis(20);

/// How far a stop had to escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    /// No process was attached.
    AlreadyExited,
    /// Exited after the IPC shutdown message.
    Graceful,
    /// Exited after SIGTERM.
    Terminated,
    /// Exited after SIGKILL.
    Killed,
    /// Still there after SIGKILL.
    Unresponsive,
}

impl Escalation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyExited => "already_exited",
            Self::Graceful => "graceful",
            Self::Terminated => "terminated",
            Self::Killed => "killed",
            Self::Unresponsive => "unresponsive",
        }
    }
}

/// Result of stopping one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub bot_id: BotId,
    pub pid: Option<u32>,
    pub escalation: Escalation,
    /// Tagged pids killed by the post-stop sweep.
    pub swept_pids: Vec<u32>,
}

struct Inner {
    registry: Mutex<Registry>,
    processes: Arc<dyn ProcessManager>,
    config: SupervisorConfig,
    metadata: Option<Arc<dyn AssistantMetadataSource>>,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// Handle to the supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.inner.config)
            .field("started_at", &self.inner.started_at)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        policy: RestartPolicy,
        mode: IngestionMode,
        processes: Arc<dyn ProcessManager>,
        metadata: Option<Arc<dyn AssistantMetadataSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::new(policy, mode)),
                processes,
                config,
                metadata,
                started_at: Utc::now(),
                started: Instant::now(),
            }),
        }
    }

    pub(crate) async fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().await
    }

    /// Run `f` against the registry under its lock.
    pub async fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let mut registry = self.registry().await;
        f(&mut registry)
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn processes(&self) -> &Arc<dyn ProcessManager> {
        &self.inner.processes
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub async fn mode(&self) -> IngestionMode {
        self.registry().await.mode()
    }

    /// Start a worker for `config`.
    ///
    /// Returns the new pid.
    ///
    /// # Errors
    ///
    /// `DuplicateStart` when the bot is already live, start-locked, or has a
    /// lifecycle operation in flight. `FleetLimitReached` at `max_workers`.
    /// Both are startup errors: callers log them and move on. `Spawn` when
    /// the OS refuses; the record is left `crashed`.
    pub async fn start(&self, config: DesiredBotConfig) -> Result<u32> {
        let bot_id = config.bot_id;
        let lock = self.registry().await.op_lock(bot_id);
        let Ok(_guard) = lock.try_lock() else {
            debug!(bot_id = %bot_id, "Start skipped, lifecycle operation in flight");
            return Err(Error::duplicate_start(bot_id, WorkerStatus::Starting));
        };
        self.start_locked(config).await
    }

    /// Start with the bot's operation lock already held.
    async fn start_locked(&self, config: DesiredBotConfig) -> Result<u32> {
        let bot_id = config.bot_id;
        let now = Instant::now();
        let settings = serde_json::to_string(&config.settings)
            .map_err(|e| Error::spawn(bot_id, format!("cannot encode settings: {e}")))?;

        let request = {
            let mut registry = self.registry().await;

            if let Some(status) = registry
                .get(bot_id)
                .map(|w| w.status)
                .filter(|s| s.is_live())
            {
                info!(bot_id = %bot_id, status = %status, "Start skipped, worker already live");
                return Err(Error::duplicate_start(bot_id, status));
            }
            if registry.is_start_locked(bot_id, now) {
                info!(bot_id = %bot_id, "Start skipped, start lock held");
                return Err(Error::duplicate_start(bot_id, WorkerStatus::Starting));
            }

            let live = registry.live_count();
            if live >= self.inner.config.max_workers {
                warn!(
                    bot_id = %bot_id,
                    live,
                    max = self.inner.config.max_workers,
                    "Start refused, fleet limit reached"
                );
                return Err(Error::fleet_limit_reached(live, self.inner.config.max_workers));
            }

            registry.remove(bot_id);
            registry.policy.cancel(bot_id);
            registry.acquire_start_lock(bot_id, self.inner.config.start_lock_grace, now);

            let mut record =
                WorkerRecord::new(bot_id, config.snapshot(), self.inner.config.log_buffer_lines);
            record.transition(WorkerStatus::Starting)?;
            registry.insert(record);

            self.spawn_request(&config, registry.mode(), settings)
        };

        let spawned = match self.inner.processes.spawn(request).await {
            Ok(spawned) => spawned,
            Err(e) => {
                warn!(bot_id = %bot_id, kind = e.kind(), error = %e, "Worker spawn failed");
                self.fail_start(bot_id).await;
                return Err(e);
            }
        };

        let pid = self.attach(bot_id, spawned).await;
        info!(bot_id = %bot_id, pid, "Worker starting");
        Ok(pid)
    }

    fn spawn_request(
        &self,
        config: &DesiredBotConfig,
        mode: IngestionMode,
        settings: String,
    ) -> SpawnRequest {
        let supervisor = &self.inner.config;
        SpawnRequest {
            bot_id: config.bot_id,
            command: supervisor.worker_command.clone(),
            args: supervisor.worker_args.clone(),
            env: vec![
                (supervisor.tag_env.clone(), config.bot_id.to_string()),
                (MODE_ENV.to_string(), mode.to_string()),
                (TOKEN_ENV.to_string(), config.external_token.clone()),
                (ASSISTANT_ENV.to_string(), config.external_assistant_id.clone()),
                (SETTINGS_ENV.to_string(), settings),
            ],
        }
    }

    async fn fail_start(&self, bot_id: BotId) {
        let mut registry = self.registry().await;
        registry.release_start_lock(bot_id);
        if let Some(record) = registry.get_mut(bot_id) {
            if let Err(e) = record.transition(WorkerStatus::Crashed) {
                warn!(bot_id = %bot_id, error = %e, "Could not mark failed start");
            }
        }
    }

    /// Stop a worker and forget the bot.
    ///
    /// A queued restart for the bot is cancelled before waiting for any
    /// in-flight operation, so a stop always wins.
    ///
    /// # Errors
    ///
    /// `WorkerNotFound` when nothing is registered. Bookkeeping is purged
    /// either way.
    pub async fn stop(&self, bot_id: BotId) -> Result<StopReport> {
        let lock = {
            let mut registry = self.registry().await;
            registry.policy.cancel(bot_id);
            registry.op_lock(bot_id)
        };

        let guard = lock.lock().await;
        let result = self.halt(bot_id, StopIntent::Stop).await;
        self.registry().await.purge(bot_id);
        drop(guard);
        drop(lock);
        self.registry().await.release_op_lock(bot_id);

        if result.is_ok() {
            info!(bot_id = %bot_id, "Worker stopped and purged");
        }
        result
    }

    /// Replace a worker's process.
    ///
    /// Uses `config` when given, otherwise the worker's current snapshot.
    /// Restart history is kept and the restart is counted.
    ///
    /// # Errors
    ///
    /// `WorkerNotFound` when there is neither a record nor a config, plus any
    /// error from the stop or start half.
    pub async fn restart(
        &self,
        bot_id: BotId,
        config: Option<DesiredBotConfig>,
        reason: &str,
    ) -> Result<u32> {
        let lock = self.registry().await.op_lock(bot_id);
        let _guard = lock.lock().await;
        self.restart_locked(bot_id, config, reason).await
    }

    async fn restart_locked(
        &self,
        bot_id: BotId,
        config: Option<DesiredBotConfig>,
        reason: &str,
    ) -> Result<u32> {
        let (config, registered) = {
            let mut registry = self.registry().await;
            let current = registry
                .get(bot_id)
                .map(|w| DesiredBotConfig::from_snapshot(bot_id, &w.snapshot));
            let registered = current.is_some();
            let config = config
                .or(current)
                .ok_or_else(|| Error::worker_not_found(bot_id))?;
            registry.policy.record_restart(bot_id, Instant::now());
            (config, registered)
        };

        info!(bot_id = %bot_id, reason, "Restarting worker");
        if registered {
            self.halt(bot_id, StopIntent::Restart).await?;
            self.registry().await.remove(bot_id);
        }
        self.start_locked(config).await
    }

    /// Take a worker down without forgetting the bot.
    async fn halt(&self, bot_id: BotId, intent: StopIntent) -> Result<StopReport> {
        let (pid, handle) = {
            let mut registry = self.registry().await;
            registry.policy.cancel(bot_id);
            let record = registry
                .get_mut(bot_id)
                .ok_or_else(|| Error::worker_not_found(bot_id))?;
            record.stop_intent = intent;
            match record.status {
                WorkerStatus::Starting | WorkerStatus::Running => {
                    record.transition(WorkerStatus::Stopping)?;
                }
                WorkerStatus::Crashed => record.transition(WorkerStatus::Stopped)?,
                WorkerStatus::Stopping | WorkerStatus::Stopped => {}
            }
            (record.pid, record.handle.clone())
        };

        let escalation = match (pid, handle) {
            (Some(pid), Some(handle)) => self.escalate(bot_id, pid, &handle).await,
            (Some(pid), None) => self.escalate_detached(bot_id, pid).await,
            (None, _) => Escalation::AlreadyExited,
        };
        let swept_pids = self.sweep(bot_id).await;

        {
            let mut registry = self.registry().await;
            registry.release_start_lock(bot_id);
            if let Some(record) = registry.get_mut(bot_id) {
                record.handle = None;
                if record.status == WorkerStatus::Stopping {
                    record.transition(WorkerStatus::Stopped)?;
                }
            }
        }

        info!(
            bot_id = %bot_id,
            pid,
            escalation = escalation.as_str(),
            swept = swept_pids.len(),
            "Worker halted"
        );
        Ok(StopReport {
            bot_id,
            pid,
            escalation,
            swept_pids,
        })
    }

    /// Shutdown message, then SIGTERM, then SIGKILL, each with its own wait.
    async fn escalate(&self, bot_id: BotId, pid: u32, handle: &WorkerHandle) -> Escalation {
        let mut exited = handle.exited.clone();
        if exited.borrow().is_some() {
            return Escalation::AlreadyExited;
        }

        let config = &self.inner.config;
        if handle.outbox.try_send(ControllerMessage::Shutdown).is_err() {
            debug!(bot_id = %bot_id, pid, "Could not queue shutdown message");
        }
        if wait_for_exit(&mut exited, config.graceful_stop_timeout).await {
            return Escalation::Graceful;
        }

        let steps = [
            (WorkerSignal::Terminate, config.terminate_timeout, Escalation::Terminated),
            (WorkerSignal::Kill, config.kill_timeout, Escalation::Killed),
        ];
        for (signal, wait, outcome) in steps {
            warn!(
                bot_id = %bot_id,
                pid,
                signal = signal.as_str(),
                "Worker did not exit, escalating"
            );
            if let Err(e) = self.inner.processes.signal(pid, signal) {
                warn!(bot_id = %bot_id, pid, error = %e, "Signal failed");
            }
            if wait_for_exit(&mut exited, wait).await {
                return outcome;
            }
        }

        error!(bot_id = %bot_id, pid, "Worker still present after SIGKILL");
        Escalation::Unresponsive
    }

    /// SIGTERM then SIGKILL for a pid with no pipe, such as an adopted one.
    /// Exit is detected by polling the liveness probe.
    async fn escalate_detached(&self, bot_id: BotId, pid: u32) -> Escalation {
        let processes = &self.inner.processes;
        if !processes.is_alive(pid) {
            return Escalation::AlreadyExited;
        }

        let config = &self.inner.config;
        let steps = [
            (WorkerSignal::Terminate, config.terminate_timeout, Escalation::Terminated),
            (WorkerSignal::Kill, config.kill_timeout, Escalation::Killed),
        ];
        for (signal, wait, outcome) in steps {
            debug!(bot_id = %bot_id, pid, signal = signal.as_str(), "Signalling detached worker");
            if let Err(e) = processes.signal(pid, signal) {
                warn!(bot_id = %bot_id, pid, error = %e, "Signal failed");
            }
            let deadline = Instant::now() + wait;
            while processes.is_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(DETACHED_POLL).await;
            }
            if !processes.is_alive(pid) {
                return outcome;
            }
        }

        error!(bot_id = %bot_id, pid, "Detached worker still present after SIGKILL");
        Escalation::Unresponsive
    }

    /// Kill every process still tagged for `bot_id`.
    async fn sweep(&self, bot_id: BotId) -> Vec<u32> {
        let processes = self
            .inner
            .processes
            .scan()
            .await
            .or_default_logged(&format!("Post-stop sweep for bot {bot_id}"), Vec::new());

        processes
            .into_iter()
            .filter(|p| p.bot_id == bot_id)
            .filter_map(|p| match self.inner.processes.signal(p.pid, WorkerSignal::Kill) {
                Ok(true) => {
                    warn!(bot_id = %bot_id, pid = p.pid, "Killed leftover tagged process");
                    Some(p.pid)
                }
                Ok(false) => None,
                Err(e) => {
                    warn!(bot_id = %bot_id, pid = p.pid, error = %e, "Sweep kill failed");
                    None
                }
            })
            .collect()
    }

    /// Ask the policy engine for a restart.
    pub async fn request_restart(&self, bot_id: BotId, reason: RestartReason) -> RestartDecision {
        let now = Instant::now();
        let mut registry = self.registry().await;
        let starting = registry.is_starting(bot_id, now);
        registry.policy.request(bot_id, reason, starting, now)
    }

    /// Execute every queued restart whose dwell has elapsed.
    pub async fn run_due_restarts(&self) -> Vec<(BotId, Result<u32>)> {
        let due = self.registry().await.policy.take_due(Instant::now());
        if due.is_empty() {
            return Vec::new();
        }

        stream::iter(due)
            .map(|entry| async move {
                let result = self.restart(entry.bot_id, None, entry.reason.as_str()).await;
                if let Err(e) = &result {
                    warn!(
                        bot_id = %entry.bot_id,
                        attempt = entry.attempt,
                        kind = e.kind(),
                        error = %e,
                        "Queued restart failed"
                    );
                }
                (entry.bot_id, result)
            })
            .buffer_unordered(FLEET_CONCURRENCY)
            .collect()
            .await
    }

    /// Stop every registered worker concurrently.
    pub async fn stop_all(&self) -> Vec<StopReport> {
        let bot_ids = self.registry().await.bot_ids();
        stream::iter(bot_ids)
            .map(|bot_id| self.stop(bot_id))
            .buffer_unordered(FLEET_CONCURRENCY)
            .filter_map(|result| async move { result.ok() })
            .collect()
            .await
    }

    /// Point the record at a different pid found by the scanner.
    ///
    /// The old pipe belongs to the old process, so it is dropped. The adopted
    /// process has no IPC channel: it gets no hot reloads or webhooks, stops
    /// by signal only, and goes silent until a health restart replaces it.
    pub async fn adopt_pid(&self, bot_id: BotId, pid: u32) -> bool {
        let mut registry = self.registry().await;
        let Some(record) = registry.get_mut(bot_id) else {
            return false;
        };
        warn!(bot_id = %bot_id, old_pid = record.pid, new_pid = pid, "Adopting observed pid");
        record.pid = Some(pid);
        if record.handle.as_ref().is_some_and(|h| h.pid != pid) {
            record.handle = None;
        }
        true
    }

    /// Mark a worker whose process vanished as crashed and drop its record.
    ///
    /// Restart history is kept; the next synchronization starts it again.
    pub async fn mark_missing(&self, bot_id: BotId) -> bool {
        let mut registry = self.registry().await;
        let Some(record) = registry.get_mut(bot_id) else {
            return false;
        };
        if let Err(e) = record.transition(WorkerStatus::Crashed) {
            debug!(bot_id = %bot_id, error = %e, "Missing worker not running");
            return false;
        }
        registry.remove(bot_id);
        registry.release_start_lock(bot_id);
        true
    }

    pub(crate) fn metadata(&self) -> Option<Arc<dyn AssistantMetadataSource>> {
        self.inner.metadata.clone()
    }
}

/// `true` once the exit watch reports an exit, or its sender is gone.
async fn wait_for_exit(exited: &mut watch::Receiver<Option<ExitInfo>>, limit: Duration) -> bool {
    tokio::time::timeout(limit, exited.wait_for(Option::is_some))
        .await
        .is_ok()
}

#[async_trait]
impl ActualStateProvider for Supervisor {
    async fn actual_state(&self) -> ActualState {
        self.registry().await.observe(Instant::now())
    }
}

#[async_trait]
impl ActionExecutor for Supervisor {
    async fn execute(&self, action: &ReconcileAction) -> fleet_reconciler::Result<()> {
        let result = match action {
            ReconcileAction::StartWorker { config } => match self.start(config.clone()).await {
                Err(e) if e.is_startup_error() => {
                    debug!(bot_id = %config.bot_id, error = %e, "Start skipped");
                    Ok(())
                }
                other => other.map(drop),
            },
            ReconcileAction::RestartWorker { config, reason } => {
                self.restart_for_sync(config, reason).await
            }
            ReconcileAction::HotReload { config, .. } => {
                self.hot_reload(config.clone(), false).await.map(drop)
            }
            ReconcileAction::StopWorker { bot_id, reason } => {
                info!(bot_id = %bot_id, reason = %reason, "Stopping worker");
                self.stop(*bot_id).await.map(drop)
            }
        };
        result.map_err(|e| fleet_reconciler::Error::action_failed(action.description(), e.to_string()))
    }
}

impl Supervisor {
    /// Crashed workers go through the policy engine; live ones restart now.
    async fn restart_for_sync(&self, config: &DesiredBotConfig, reason: &str) -> Result<()> {
        let bot_id = config.bot_id;
        let crashed = {
            let mut registry = self.registry().await;
            match registry.get_mut(bot_id) {
                Some(record) if record.status == WorkerStatus::Crashed => {
                    record.snapshot = config.snapshot();
                    true
                }
                _ => false,
            }
        };

        if crashed {
            let decision = self.request_restart(bot_id, RestartReason::Resync).await;
            debug!(bot_id = %bot_id, ?decision, "Crashed worker handed to restart policy");
            return Ok(());
        }
        self.restart(bot_id, Some(config.clone()), reason).await.map(drop)
    }
}
