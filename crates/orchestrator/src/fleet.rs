//! Wiring of the controller components.
//!
//! [`Fleet`] owns one supervisor and the components built around it, and is
//! the handle the HTTP surface and the binary work against.

use std::sync::Arc;

use fleet_core::{BotId, Error, Result};
use fleet_reconciler::{
    DesiredState, DesiredStateProvider, InMemoryDesiredStateProvider, ReconcileResult, Reconciler,
    ReconcilerConfig, Synchronizer,
};
use futures::stream::{self, StreamExt};
use ractor::{Actor, ActorRef};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::{AlertFanout, AlertSink, TracingAlertSink, WebhookAlertSink};
use crate::config::FleetConfig;
use crate::control_loop::{ControlLoop, ControlMessage, ControlTasks};
use crate::control_plane::{AssistantMetadataSource, HttpControlPlane};
use crate::health::HealthMonitor;
use crate::policy::RestartPolicy;
use crate::process::{NativeProcessManager, ProcessManager};
use crate::scanner::{BotProcesses, ScanReport, Scanner};
use crate::scheduler::Schedule;
use crate::supervisor::{FLEET_CONCURRENCY, HotReloadOutcome, StopReport, Supervisor};
use crate::views::{FleetMetrics, StatusView};

/// Per-bot result of `hot_reload_bots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotReloadResult {
    pub bot_id: BotId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<HotReloadOutcome>,
    /// Set when the bot had no worker and one was started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BotReloadResult {
    fn failed(bot_id: BotId, error: impl ToString) -> Self {
        Self {
            bot_id,
            outcome: None,
            started_pid: None,
            error: Some(error.to_string()),
        }
    }
}

/// Summary of a synchronization pass for the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub desired: usize,
    pub actual: usize,
    pub converged: bool,
    pub started: Vec<BotId>,
    pub stopped: Vec<BotId>,
    pub restarted: Vec<BotId>,
    pub hot_reloaded: Vec<BotId>,
    pub failed: Vec<String>,
}

impl From<&ReconcileResult> for SyncSummary {
    fn from(result: &ReconcileResult) -> Self {
        Self {
            desired: result.desired_count,
            actual: result.actual_count,
            converged: result.converged,
            started: result.bots_for("start"),
            stopped: result.bots_for("stop"),
            restarted: result.bots_for("restart"),
            hot_reloaded: result.bots_for("hot_reload"),
            failed: result
                .actions_failed
                .iter()
                .map(|(action, error)| format!("{}: {error}", action.description()))
                .collect(),
        }
    }
}

type ControlHandle = (ActorRef<ControlMessage>, JoinHandle<()>);

/// The assembled controller.
pub struct Fleet {
    config: FleetConfig,
    supervisor: Supervisor,
    synchronizer: Arc<Synchronizer>,
    scanner: Scanner,
    health: Arc<HealthMonitor>,
    control: Mutex<Option<ControlHandle>>,
}

impl Fleet {
    /// Assemble a fleet from its external collaborators.
    pub fn new(
        config: FleetConfig,
        processes: Arc<dyn ProcessManager>,
        desired: Arc<dyn DesiredStateProvider>,
        metadata: Option<Arc<dyn AssistantMetadataSource>>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Self {
        let policy = RestartPolicy::new(config.restart.clone(), config.emergency.clone());
        let supervisor = Supervisor::new(
            config.supervisor.clone(),
            policy,
            config.server.mode,
            processes,
            metadata,
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(supervisor.clone()),
            ReconcilerConfig::default(),
        ));
        let synchronizer = Arc::new(Synchronizer::new(
            reconciler,
            desired,
            Arc::new(supervisor.clone()),
        ));
        let scanner = Scanner::new(supervisor.clone(), config.scanner.clone());
        let health = Arc::new(
            HealthMonitor::new(
                supervisor.clone(),
                config.health.clone(),
                config.emergency.reload_pause,
                AlertFanout::new(sinks),
            )
            .with_synchronizer(Arc::clone(&synchronizer)),
        );

        Self {
            config,
            supervisor,
            synchronizer,
            scanner,
            health,
            control: Mutex::new(None),
        }
    }

    /// Assemble the production fleet: native processes, the HTTP control
    /// plane, and the configured alert sinks.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` when an HTTP client cannot be built.
    pub fn from_config(config: FleetConfig) -> Result<Self> {
        let processes: Arc<dyn ProcessManager> = Arc::new(NativeProcessManager::new(
            config.scanner.proc_root.clone(),
            config.supervisor.tag_env.clone(),
        ));

        let (desired, metadata) = match HttpControlPlane::from_config(&config.control_plane)? {
            Some(control_plane) => {
                info!(url = %control_plane.base_url(), "Using control plane");
                let control_plane = Arc::new(control_plane);
                let desired: Arc<dyn DesiredStateProvider> = control_plane.clone();
                let metadata: Arc<dyn AssistantMetadataSource> = control_plane;
                (desired, Some(metadata))
            }
            None => {
                warn!("No control plane configured, desired state is empty");
                let desired: Arc<dyn DesiredStateProvider> =
                    Arc::new(InMemoryDesiredStateProvider::new(DesiredState::new()));
                (desired, None)
            }
        };

        let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(TracingAlertSink)];
        if let Some(url) = config.emergency.alert_webhook_url.clone() {
            sinks.push(Arc::new(WebhookAlertSink::new(url, config.control_plane.timeout)?));
        }

        Ok(Self::new(config, processes, desired, metadata, sinks))
    }

    #[must_use]
    pub const fn config(&self) -> &FleetConfig {
        &self.config
    }

    #[must_use]
    pub const fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    #[must_use]
    pub const fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.synchronizer
    }

    #[must_use]
    pub const fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    #[must_use]
    pub const fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Start the control loop actor and its tickers.
    ///
    /// # Errors
    ///
    /// `Io` when the actor cannot be spawned.
    pub async fn spawn_control_loop(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        if control.is_some() {
            return Ok(());
        }
        let tasks = Arc::new(ControlTasks {
            supervisor: self.supervisor.clone(),
            synchronizer: Arc::clone(&self.synchronizer),
            scanner: self.scanner.clone(),
            health: Arc::clone(&self.health),
        });
        let schedules = Schedule::from_config(&self.config);
        let handle = Actor::spawn(Some("fleet-control-loop".to_string()), ControlLoop, (tasks, schedules))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("control loop: {e}"))))?;
        *control = Some(handle);
        Ok(())
    }

    /// Stop the control loop and wait for it to exit.
    pub async fn stop_control_loop(&self) {
        let Some((actor, join)) = self.control.lock().await.take() else {
            return;
        };
        if actor.send_message(ControlMessage::Stop).is_err() {
            actor.stop(None);
        }
        if let Err(e) = join.await {
            warn!(error = %e, "Control loop exited abnormally");
        }
    }

    pub async fn control_loop_running(&self) -> bool {
        self.control.lock().await.is_some()
    }

    /// Run one synchronization pass now.
    ///
    /// # Errors
    ///
    /// `Sync` when the desired state could not be fetched.
    pub async fn sync_now(&self) -> Result<SyncSummary> {
        let result = self.synchronizer.sync_once().await?;
        Synchronizer::log_result(&result);
        Ok(SyncSummary::from(&result))
    }

    /// Re-fetch the desired state and re-apply it for `bot_ids` only.
    ///
    /// # Errors
    ///
    /// `Sync` when the desired state could not be fetched.
    pub async fn reload_bots(&self, bot_ids: &[BotId]) -> Result<SyncSummary> {
        let result = self.synchronizer.sync_bots(bot_ids).await?;
        Synchronizer::log_result(&result);
        Ok(SyncSummary::from(&result))
    }

    /// Push freshly fetched desired config to each bot through the hot
    /// reload path. Bots without a worker are started.
    ///
    /// # Errors
    ///
    /// `Sync` when the desired state could not be fetched. Per-bot failures
    /// are reported in the result list.
    pub async fn hot_reload_bots(&self, bot_ids: &[BotId], force: bool) -> Result<Vec<BotReloadResult>> {
        let desired = self.synchronizer.fetch_desired().await?;
        let desired = &desired;

        let mut results: Vec<BotReloadResult> = stream::iter(bot_ids.iter().copied())
            .map(|bot_id| async move {
                let Some(config) = desired.active_config(bot_id).cloned() else {
                    return BotReloadResult::failed(bot_id, "bot is not active in the desired state");
                };
                let registered = self
                    .supervisor
                    .with_registry(|r| r.get(bot_id).is_some())
                    .await;

                if registered {
                    match self.supervisor.hot_reload(config, force).await {
                        Ok(outcome) => BotReloadResult {
                            bot_id,
                            outcome: Some(outcome),
                            started_pid: None,
                            error: None,
                        },
                        Err(e) => BotReloadResult::failed(bot_id, e),
                    }
                } else {
                    match self.supervisor.start(config).await {
                        Ok(pid) => BotReloadResult {
                            bot_id,
                            outcome: None,
                            started_pid: Some(pid),
                            error: None,
                        },
                        Err(e) => BotReloadResult::failed(bot_id, e),
                    }
                }
            })
            .buffer_unordered(FLEET_CONCURRENCY)
            .collect()
            .await;
        results.sort_by_key(|r| r.bot_id);
        Ok(results)
    }

    /// Restart a bot immediately, bypassing the restart queue.
    ///
    /// A bot without a record is started from the last fetched desired state.
    ///
    /// # Errors
    ///
    /// `WorkerNotFound` when the bot is neither registered nor desired, plus
    /// any lifecycle error.
    pub async fn force_restart(&self, bot_id: BotId, reason: &str) -> Result<u32> {
        match self.supervisor.restart(bot_id, None, reason).await {
            Err(Error::WorkerNotFound { .. }) => {
                let config = self
                    .synchronizer
                    .last_desired()
                    .await
                    .and_then(|d| d.active_config(bot_id).cloned())
                    .ok_or_else(|| Error::worker_not_found(bot_id))?;
                self.supervisor.restart(bot_id, Some(config), reason).await
            }
            other => other,
        }
    }

    /// # Errors
    ///
    /// `ProcessScan` when the process table cannot be read.
    pub async fn scan_now(&self) -> Result<ScanReport> {
        self.scanner.run_cycle(true).await
    }

    /// # Errors
    ///
    /// `ProcessScan` when the process table cannot be read.
    pub async fn processes(&self) -> Result<Vec<BotProcesses>> {
        self.scanner.inspect().await
    }

    pub async fn status(&self) -> StatusView {
        let mut status = self.supervisor.status_view().await;
        status.last_sync = self.synchronizer.stats().await.last_success;
        status
    }

    pub async fn metrics(&self) -> FleetMetrics {
        self.supervisor.metrics().await
    }

    /// Stop the control loop, then every worker.
    pub async fn shutdown(&self) -> Vec<StopReport> {
        self.stop_control_loop().await;
        let reports = self.supervisor.stop_all().await;
        info!(stopped = reports.len(), "All workers stopped");
        reports
    }
}
