//! Health & Resource Monitor.
//!
//! Heartbeat checks find silent workers and feed the circuit breaker; memory
//! checks find workers over their ceiling. Both hand restarts to the policy
//! engine rather than restarting directly.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::{BotId, Error, WorkerStatus};
use fleet_reconciler::Synchronizer;
use im::Vector;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{AlertFanout, AlertRecord};
use crate::config::HealthConfig;
use crate::policy::{EmergencyAction, RestartReason, scale};
use crate::supervisor::Supervisor;

const MAX_RECENT_ALERTS: usize = 100;
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Outcome of one heartbeat check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeartbeatReport {
    pub checked: usize,
    pub unresponsive: Vec<BotId>,
    pub stabilized: Vec<BotId>,
    pub restarts_enqueued: Vec<BotId>,
    pub alerts: Vec<AlertRecord>,
    pub fleet_reloaded: bool,
}

/// Outcome of one memory check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryReport {
    pub checked: usize,
    pub over_limit: Vec<BotId>,
}

pub struct HealthMonitor {
    supervisor: Supervisor,
    config: HealthConfig,
    reload_pause: Duration,
    alerts: AlertFanout,
    synchronizer: Option<Arc<Synchronizer>>,
    recent_alerts: RwLock<Vector<AlertRecord>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        supervisor: Supervisor,
        config: HealthConfig,
        reload_pause: Duration,
        alerts: AlertFanout,
    ) -> Self {
        Self {
            supervisor,
            config,
            reload_pause,
            alerts,
            synchronizer: None,
            recent_alerts: RwLock::new(Vector::new()),
        }
    }

    /// Synchronizer used to bring the fleet back after an emergency reload.
    #[must_use]
    pub fn with_synchronizer(mut self, synchronizer: Arc<Synchronizer>) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Alerts raised since startup, newest last.
    pub async fn recent_alerts(&self) -> Vector<AlertRecord> {
        self.recent_alerts.read().await.clone()
    }

    /// Find silent workers, evaluate the circuit breaker, and request
    /// restarts for the silent ones.
    pub async fn check_heartbeats(&self) -> HeartbeatReport {
        let now = Instant::now();
        let (mut report, actions) = self
            .supervisor
            .with_registry(|registry| {
                let timeout = scale(
                    self.config.heartbeat_timeout,
                    registry.policy.cooldown_multiplier(now),
                );
                let stabilization = registry.policy.config().stabilization;

                let mut report = HeartbeatReport::default();
                for worker in registry.workers() {
                    let checked = matches!(worker.status, WorkerStatus::Starting | WorkerStatus::Running)
                        && worker.has_process();
                    if !checked {
                        continue;
                    }
                    report.checked += 1;
                    if worker.silent_for(now) > timeout {
                        report.unresponsive.push(worker.bot_id);
                    } else if worker
                        .running_since
                        .is_some_and(|since| now.saturating_duration_since(since) >= stabilization)
                    {
                        report.stabilized.push(worker.bot_id);
                    }
                }
                report
                    .stabilized
                    .retain(|bot_id| registry.policy.stabilize(*bot_id));

                let actions = registry.policy.evaluate_emergency(
                    report.checked,
                    report.unresponsive.len(),
                    now,
                );
                (report, actions)
            })
            .await;

        for action in &actions {
            let alert = action.alert().clone();
            self.alerts.notify(&alert).await;
            self.remember(alert.clone()).await;
            report.alerts.push(alert);
        }

        if actions
            .iter()
            .any(|a| matches!(a, EmergencyAction::ReloadFleet(_)))
        {
            self.reload_fleet().await;
            report.fleet_reloaded = true;
            return report;
        }

        for bot_id in &report.unresponsive {
            let silent = self
                .supervisor
                .with_registry(|r| r.get(*bot_id).map(|w| w.silent_for(now).as_secs()))
                .await
                .unwrap_or_default();
            let err = Error::health_timeout(*bot_id, silent);
            warn!(bot_id = %bot_id, kind = err.kind(), "{err}");
            let decision = self
                .supervisor
                .request_restart(*bot_id, RestartReason::HealthTimeout)
                .await;
            if decision.is_enqueued() {
                report.restarts_enqueued.push(*bot_id);
            }
        }

        debug!(
            checked = report.checked,
            unresponsive = report.unresponsive.len(),
            "Heartbeat check finished"
        );
        report
    }

    /// Stop every worker, pause, then resynchronize from the control plane.
    async fn reload_fleet(&self) {
        let stopped = self.supervisor.stop_all().await;
        warn!(
            stopped = stopped.len(),
            pause_ms = u64::try_from(self.reload_pause.as_millis()).unwrap_or(u64::MAX),
            "Emergency fleet reload: all workers stopped"
        );
        tokio::time::sleep(self.reload_pause).await;

        match &self.synchronizer {
            Some(synchronizer) => match synchronizer.sync_once().await {
                Ok(result) => {
                    info!(started = result.bots_for("start").len(), "Emergency fleet reload finished");
                }
                Err(e) => warn!(error = %e, "Emergency fleet reload could not resync"),
            },
            None => info!("No synchronizer attached, fleet reload waits for the next sync"),
        }
    }

    async fn remember(&self, alert: AlertRecord) {
        let mut recent = self.recent_alerts.write().await;
        recent.push_back(alert);
        while recent.len() > MAX_RECENT_ALERTS {
            recent.pop_front();
        }
    }

    /// Request a restart for every running worker over the memory ceiling.
    pub async fn check_memory(&self) -> MemoryReport {
        let targets: Vec<(BotId, u32, Option<u64>)> = self
            .supervisor
            .with_registry(|registry| {
                registry
                    .workers()
                    .filter(|w| w.status == WorkerStatus::Running)
                    .filter_map(|w| w.pid.map(|pid| (w.bot_id, pid, w.rss_bytes)))
                    .collect()
            })
            .await;

        let mut report = MemoryReport {
            checked: targets.len(),
            over_limit: Vec::new(),
        };
        for (bot_id, pid, reported) in targets {
            let measured = self.supervisor.processes().rss_bytes(pid).await;
            if let Some(rss) = measured {
                self.supervisor
                    .with_registry(|r| {
                        if let Some(record) = r.get_mut(bot_id) {
                            record.rss_bytes = Some(rss);
                        }
                    })
                    .await;
            }

            let Some(rss_mb) = measured.or(reported).map(|b| b / BYTES_PER_MB) else {
                continue;
            };
            if rss_mb <= self.config.memory_limit_mb {
                continue;
            }

            let err = Error::resource_limit(bot_id, rss_mb, self.config.memory_limit_mb);
            warn!(bot_id = %bot_id, pid, kind = err.kind(), "{err}");
            self.supervisor
                .request_restart(bot_id, RestartReason::ResourceLimit)
                .await;
            report.over_limit.push(bot_id);
        }
        report
    }
}
