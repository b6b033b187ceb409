//! In-memory collaborators for tests.
//!
//! [`FakeProcessManager`] hands out fake pids backed by in-process worker
//! tasks that speak the real frame protocol over duplex pipes. Tests script
//! exits, inject stray tagged processes, and inspect the signals sent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{BotId, Error, Result};
use fleet_ipc::{ControllerMessage, FrameReader, FrameWriter, WorkerMessage};
use futures::FutureExt;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::alerts::{AlertRecord, AlertSink};
use crate::process::{ExitInfo, ProcessManager, SpawnRequest, SpawnedWorker, TaggedProcess, WorkerSignal};

const PIPE_CAPACITY: usize = 64 * 1024;
const FIRST_PID: u32 = 1000;
const CONTROLLER_PID: u32 = 1;
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// How fake workers react to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeBehavior {
    /// Send `Ready` right after spawn.
    pub auto_ready: bool,
    /// Acknowledge hot reloads as applied.
    pub ack_reloads: bool,
    /// Exit with code 0 on `Shutdown`.
    pub exit_on_shutdown: bool,
    /// Survive SIGTERM.
    pub ignore_terminate: bool,
    /// Send heartbeats on this period.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            auto_ready: true,
            ack_reloads: true,
            exit_on_shutdown: true,
            ignore_terminate: false,
            heartbeat_interval: None,
        }
    }
}

impl FakeBehavior {
    /// A worker that ignores everything short of SIGKILL.
    #[must_use]
    pub fn stubborn() -> Self {
        Self {
            exit_on_shutdown: false,
            ignore_terminate: true,
            ..Self::default()
        }
    }
}

struct FakeProcess {
    bot_id: BotId,
    ppid: u32,
    alive: bool,
    hidden: bool,
    rss_bytes: Option<u64>,
    exit_tx: Option<oneshot::Sender<ExitInfo>>,
    emit_tx: Option<mpsc::UnboundedSender<WorkerMessage>>,
    task: Option<JoinHandle<()>>,
    received: Vec<ControllerMessage>,
}

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    processes: BTreeMap<u32, FakeProcess>,
    requests: Vec<SpawnRequest>,
    signals: Vec<(u32, WorkerSignal)>,
    failing_bots: HashSet<BotId>,
    behaviors: HashMap<BotId, FakeBehavior>,
    default_behavior: FakeBehavior,
}

impl FakeState {
    fn allocate_pid(&mut self) -> u32 {
        let pid = self.next_pid.max(FIRST_PID);
        self.next_pid = pid.saturating_add(1);
        pid
    }

    fn exit(&mut self, pid: u32, info: ExitInfo) -> bool {
        let Some(process) = self.processes.get_mut(&pid).filter(|p| p.alive) else {
            return false;
        };
        process.alive = false;
        process.emit_tx = None;
        if let Some(exit_tx) = process.exit_tx.take() {
            let _ = exit_tx.send(info);
        }
        if let Some(task) = process.task.take() {
            task.abort();
        }
        true
    }
}

/// Process manager with fake pids and scripted behavior.
#[derive(Clone, Default)]
pub struct FakeProcessManager {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcessManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_behavior(self, behavior: FakeBehavior) -> Self {
        self.state().default_behavior = behavior;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Behavior for workers of one bot spawned from now on.
    pub fn set_behavior(&self, bot_id: BotId, behavior: FakeBehavior) {
        self.state().behaviors.insert(bot_id, behavior);
    }

    /// Make spawns for `bot_id` fail until cleared.
    pub fn fail_spawns(&self, bot_id: BotId, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_bots.insert(bot_id);
        } else {
            state.failing_bots.remove(&bot_id);
        }
    }

    /// Add a tagged process the controller did not start.
    pub fn inject_process(&self, bot_id: BotId) -> u32 {
        let mut state = self.state();
        let pid = state.allocate_pid();
        state.processes.insert(
            pid,
            FakeProcess {
                bot_id,
                ppid: CONTROLLER_PID,
                alive: true,
                hidden: false,
                rss_bytes: None,
                exit_tx: None,
                emit_tx: None,
                task: None,
                received: Vec::new(),
            },
        );
        pid
    }

    /// Keep a process alive but out of scan results.
    pub fn hide_from_scan(&self, pid: u32) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.hidden = true;
        }
    }

    /// Make a process exit on its own.
    pub fn crash(&self, pid: u32, code: i32) -> bool {
        self.state().exit(pid, ExitInfo::code(code))
    }

    /// Remove a process without reporting an exit through its pipe.
    pub fn vanish(&self, pid: u32) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.alive = false;
            process.emit_tx = None;
        }
    }

    /// Send a message from a worker to the controller.
    pub fn emit(&self, pid: u32, message: WorkerMessage) -> bool {
        self.state()
            .processes
            .get(&pid)
            .and_then(|p| p.emit_tx.as_ref())
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    pub fn set_rss(&self, pid: u32, bytes: u64) {
        if let Some(process) = self.state().processes.get_mut(&pid) {
            process.rss_bytes = Some(bytes);
        }
    }

    /// Messages a worker received from the controller.
    #[must_use]
    pub fn received(&self, pid: u32) -> Vec<ControllerMessage> {
        self.state()
            .processes
            .get(&pid)
            .map(|p| p.received.clone())
            .unwrap_or_default()
    }

    /// Every spawn request, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.state().requests.clone()
    }

    #[must_use]
    pub fn spawn_count(&self, bot_id: BotId) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.bot_id == bot_id)
            .count()
    }

    /// Every signal sent, in order.
    #[must_use]
    pub fn signals(&self) -> Vec<(u32, WorkerSignal)> {
        self.state().signals.clone()
    }

    #[must_use]
    pub fn alive(&self, bot_id: BotId) -> Vec<u32> {
        self.state()
            .processes
            .iter()
            .filter(|(_, p)| p.alive && p.bot_id == bot_id)
            .map(|(pid, _)| *pid)
            .collect()
    }
}

#[async_trait]
impl ProcessManager for FakeProcessManager {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker> {
        let (controller_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, controller_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();

        let mut state = self.state();
        let bot_id = request.bot_id;
        state.requests.push(request);
        if state.failing_bots.contains(&bot_id) {
            return Err(Error::spawn(bot_id, "injected spawn failure"));
        }

        let pid = state.allocate_pid();
        let behavior = state
            .behaviors
            .get(&bot_id)
            .copied()
            .unwrap_or(state.default_behavior);
        let task = tokio::spawn(run_worker(
            pid,
            behavior,
            FrameReader::new(worker_stdin),
            FrameWriter::new(worker_stdout),
            emit_rx,
            Arc::clone(&self.state),
        ));
        state.processes.insert(
            pid,
            FakeProcess {
                bot_id,
                ppid: CONTROLLER_PID,
                alive: true,
                hidden: false,
                rss_bytes: None,
                exit_tx: Some(exit_tx),
                emit_tx: Some(emit_tx),
                task: Some(task),
                received: Vec::new(),
            },
        );

        Ok(SpawnedWorker {
            pid,
            stdin: Box::new(controller_stdin),
            stdout: Box::new(controller_stdout),
            exit: exit_rx
                .map(|r| r.unwrap_or_else(|_| ExitInfo::signaled(SIGKILL)))
                .boxed(),
        })
    }

    fn signal(&self, pid: u32, signal: WorkerSignal) -> Result<bool> {
        let mut state = self.state();
        state.signals.push((pid, signal));
        let Some(process) = state.processes.get(&pid).filter(|p| p.alive) else {
            return Ok(false);
        };
        let ignores = signal == WorkerSignal::Terminate
            && state
                .behaviors
                .get(&process.bot_id)
                .copied()
                .unwrap_or(state.default_behavior)
                .ignore_terminate;
        if !ignores {
            let info = match signal {
                WorkerSignal::Terminate => ExitInfo::signaled(SIGTERM),
                WorkerSignal::Kill => ExitInfo::signaled(SIGKILL),
            };
            state.exit(pid, info);
        }
        Ok(true)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.state().processes.get(&pid).is_some_and(|p| p.alive)
    }

    async fn scan(&self) -> Result<Vec<TaggedProcess>> {
        Ok(self
            .state()
            .processes
            .iter()
            .filter(|(_, p)| p.alive && !p.hidden)
            .map(|(pid, p)| TaggedProcess {
                pid: *pid,
                ppid: p.ppid,
                bot_id: p.bot_id,
                rss_bytes: p.rss_bytes,
            })
            .collect())
    }

    async fn rss_bytes(&self, pid: u32) -> Option<u64> {
        self.state()
            .processes
            .get(&pid)
            .filter(|p| p.alive)
            .and_then(|p| p.rss_bytes)
    }
}

fn reply_to(pid: u32, behavior: FakeBehavior, message: &ControllerMessage) -> Option<WorkerMessage> {
    match message {
        ControllerMessage::HotReload { revision, .. } => Some(WorkerMessage::HotReloadAck {
            revision: *revision,
            applied: behavior.ack_reloads,
            error: (!behavior.ack_reloads).then(|| format!("worker {pid} refused reload")),
        }),
        _ => None,
    }
}

async fn run_worker(
    pid: u32,
    behavior: FakeBehavior,
    mut reader: FrameReader<DuplexStream>,
    mut writer: FrameWriter<DuplexStream>,
    mut emit_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    state: Arc<Mutex<FakeState>>,
) {
    if behavior.auto_ready && writer.send(&WorkerMessage::Ready { pid }).await.is_err() {
        return;
    }
    let period = behavior
        .heartbeat_interval
        .unwrap_or(Duration::from_secs(3600));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        let outgoing = tokio::select! {
            received = reader.recv::<ControllerMessage>() => {
                let Ok(message) = received else { break };
                let reply = reply_to(pid, behavior, &message);
                let shutdown = message == ControllerMessage::Shutdown;
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(process) = guard.processes.get_mut(&pid) {
                    process.received.push(message);
                }
                if shutdown && behavior.exit_on_shutdown {
                    guard.exit(pid, ExitInfo::code(0));
                    break;
                }
                reply
            }
            emitted = emit_rx.recv() => {
                let Some(message) = emitted else { break };
                Some(message)
            }
            _ = heartbeat.tick(), if behavior.heartbeat_interval.is_some() => {
                Some(WorkerMessage::Heartbeat { rss_bytes: None })
            }
        };
        if let Some(message) = outgoing {
            if writer.send(&message).await.is_err() {
                break;
            }
        }
    }
}

/// Alert sink that keeps every alert.
#[derive(Clone, Default)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<AlertRecord>>>,
}

impl RecordingAlertSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, alert: &AlertRecord) -> Result<()> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}
