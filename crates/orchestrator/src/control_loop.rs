//! The control loop actor.
//!
//! A single ractor actor receives ticks from the [`Scheduler`] and runs the
//! matching control task on its own tokio task. A tick that arrives while
//! the previous run of the same task is still going is dropped, so a slow
//! control-plane fetch never piles up sync passes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use fleet_core::ResultExt;
use fleet_reconciler::Synchronizer;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tracing::{debug, error, info};

use crate::health::HealthMonitor;
use crate::scanner::Scanner;
use crate::scheduler::{Schedule, Scheduler, SchedulerHandle, TaskKind, TickSink};
use crate::supervisor::Supervisor;

/// Messages handled by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// A schedule fired.
    Tick(TaskKind),
    /// A task run finished.
    Finished(TaskKind),
    /// Stop the tickers and the actor.
    Stop,
}

impl TickSink for ActorRef<ControlMessage> {
    fn tick(&self, kind: TaskKind) -> bool {
        self.send_message(ControlMessage::Tick(kind)).is_ok()
    }
}

/// The components each task kind drives.
pub struct ControlTasks {
    pub supervisor: Supervisor,
    pub synchronizer: Arc<Synchronizer>,
    pub scanner: Scanner,
    pub health: Arc<HealthMonitor>,
}

impl ControlTasks {
    /// Run one task to completion. Failures are logged, never returned.
    pub async fn run(&self, kind: TaskKind) {
        match kind {
            TaskKind::Sync => {
                if let Ok(result) = self.synchronizer.sync_once().await {
                    Synchronizer::log_result(&result);
                }
            }
            TaskKind::Scan => {
                self.scanner.run_cycle(true).await.into_option_logged("Scan cycle");
            }
            TaskKind::Health => {
                self.health.check_heartbeats().await;
            }
            TaskKind::Memory => {
                self.health.check_memory().await;
            }
            TaskKind::RestartQueue => {
                let results = self.supervisor.run_due_restarts().await;
                if !results.is_empty() {
                    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                    info!(executed = results.len(), failed, "Restart queue drained");
                }
            }
        }
    }
}

pub struct ControlLoopState {
    tasks: Arc<ControlTasks>,
    busy: HashSet<TaskKind>,
    scheduler: Option<SchedulerHandle>,
    completed: BTreeMap<TaskKind, u64>,
    skipped: u64,
}

impl ControlLoopState {
    #[must_use]
    pub fn completed(&self, kind: TaskKind) -> u64 {
        self.completed.get(&kind).copied().unwrap_or_default()
    }

    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    fn stop_scheduler(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
    }
}

/// Actor definition for the control loop.
#[derive(Clone, Default)]
pub struct ControlLoop;

impl Actor for ControlLoop {
    type Msg = ControlMessage;
    type State = ControlLoopState;
    type Arguments = (Arc<ControlTasks>, Vec<Schedule>);

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (tasks, schedules) = args;
        info!(tasks = schedules.len(), "Control loop starting");
        let scheduler = Scheduler::start(&schedules, myself);
        Ok(ControlLoopState {
            tasks,
            busy: HashSet::new(),
            scheduler: Some(scheduler),
            completed: BTreeMap::new(),
            skipped: 0,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ControlMessage::Tick(kind) => {
                if !state.busy.insert(kind) {
                    state.skipped = state.skipped.saturating_add(1);
                    debug!(task = %kind, "Previous run still in progress, tick dropped");
                    return Ok(());
                }
                let tasks = Arc::clone(&state.tasks);
                tokio::spawn(async move {
                    // A panicking run must still free its slot.
                    let run = tokio::spawn(async move { tasks.run(kind).await });
                    if let Err(e) = run.await {
                        error!(task = %kind, error = %e, "Control task aborted");
                    }
                    let _ = myself.send_message(ControlMessage::Finished(kind));
                });
            }
            ControlMessage::Finished(kind) => {
                state.busy.remove(&kind);
                let count = state.completed.entry(kind).or_default();
                *count = count.saturating_add(1);
            }
            ControlMessage::Stop => {
                info!(in_flight = state.busy.len(), "Control loop stopping");
                state.stop_scheduler();
                myself.stop(None);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.stop_scheduler();
        debug!(skipped = state.skipped, "Control loop stopped");
        Ok(())
    }
}
