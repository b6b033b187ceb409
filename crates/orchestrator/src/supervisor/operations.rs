//! Operator and fleet-wide operations on top of the lifecycle primitives.

use std::collections::BTreeSet;

use fleet_core::{BotId, DesiredBotConfig, Error, IngestionMode, Result, ResultExt, WorkerStatus};
use fleet_ipc::ControllerMessage;
use fleet_reconciler::{ConfigDelta, ConfigField, classify};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde::Serialize;
use tap::Tap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{FLEET_CONCURRENCY, Supervisor};
use crate::process::WorkerSignal;
use crate::registry::{PendingReload, ReloadAck};

/// What a hot reload ended up doing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HotReloadOutcome {
    /// The worker already runs this configuration.
    Unchanged,
    /// Settings were pushed and acknowledged in place.
    Applied {
        revision: u64,
        fields: Vec<&'static str>,
    },
    /// The worker was replaced.
    Restarted { pid: u32, reason: String },
    /// The worker is not running, so nothing was pushed.
    Skipped { status: WorkerStatus },
}

impl HotReloadOutcome {
    #[must_use]
    pub const fn restarted(&self) -> bool {
        matches!(self, Self::Restarted { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheClearReport {
    pub notified: Vec<BotId>,
    pub missing: Vec<BotId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRestart {
    pub bot_id: BotId,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartAllReport {
    pub restarted: Vec<BotId>,
    pub failed: Vec<FailedRestart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeSwitchReport {
    pub previous: IngestionMode,
    pub mode: IngestionMode,
    pub changed: bool,
    pub restarted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Crashed or stopped records removed.
    pub purged: Vec<BotId>,
    pub expired_start_locks: Vec<BotId>,
    /// Tagged pids with no registry entry that were killed.
    pub orphans_killed: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NuclearReport {
    pub killed: Vec<u32>,
    pub cleared: Vec<BotId>,
}

enum ReloadPlan {
    Restart(String),
    Push {
        outbox: tokio::sync::mpsc::Sender<ControllerMessage>,
        revision: u64,
        settings: fleet_core::MutableSettings,
        fields: Vec<ConfigField>,
        ack: oneshot::Receiver<ReloadAck>,
    },
}

fn field_names(fields: &[ConfigField]) -> Vec<&'static str> {
    fields.iter().map(ConfigField::as_str).collect()
}

impl Supervisor {
    /// Apply a desired configuration to a running worker.
    ///
    /// Critical changes, or `force`, restart the worker. Mutable-only changes
    /// are pushed over IPC and fall back to a restart when the worker does not
    /// acknowledge them in time.
    ///
    /// # Errors
    ///
    /// `WorkerNotFound` when the bot has no record, or any restart error.
    pub async fn hot_reload(&self, config: DesiredBotConfig, force: bool) -> Result<HotReloadOutcome> {
        let bot_id = config.bot_id;
        let lock = self.registry().await.op_lock(bot_id);
        let _guard = lock.lock().await;

        let plan = {
            let mut registry = self.registry().await;
            let record = registry
                .get_mut(bot_id)
                .ok_or_else(|| Error::worker_not_found(bot_id))?;

            if force {
                ReloadPlan::Restart("forced reload".to_string())
            } else if record.status != WorkerStatus::Running {
                return Ok(HotReloadOutcome::Skipped {
                    status: record.status,
                });
            } else {
                match classify(&record.snapshot, &config) {
                    ConfigDelta::Unchanged => return Ok(HotReloadOutcome::Unchanged),
                    ConfigDelta::Critical { fields } => ReloadPlan::Restart(format!(
                        "critical config change: {}",
                        field_names(&fields).join(", ")
                    )),
                    ConfigDelta::Mutable { settings, fields } => {
                        match record.handle.as_ref().map(|h| h.outbox.clone()) {
                            None => ReloadPlan::Restart("worker has no channel".to_string()),
                            Some(outbox) => {
                                let revision = record.snapshot.revision.saturating_add(1);
                                let (reply, ack) = oneshot::channel();
                                record.pending_reload = Some(PendingReload { revision, reply });
                                ReloadPlan::Push {
                                    outbox,
                                    revision,
                                    settings,
                                    fields,
                                    ack,
                                }
                            }
                        }
                    }
                }
            }
        };

        let (outbox, revision, settings, fields, ack) = match plan {
            ReloadPlan::Restart(reason) => {
                let pid = self.restart_locked(bot_id, Some(config), &reason).await?;
                return Ok(HotReloadOutcome::Restarted { pid, reason });
            }
            ReloadPlan::Push {
                outbox,
                revision,
                settings,
                fields,
                ack,
            } => (outbox, revision, settings, fields, ack),
        };

        let sent = outbox
            .send(ControllerMessage::HotReload {
                revision,
                settings: settings.clone(),
            })
            .await
            .is_ok();
        let reply = if sent {
            tokio::time::timeout(self.config().hot_reload_ack_timeout, ack)
                .await
                .ok()
                .and_then(std::result::Result::ok)
        } else {
            None
        };

        if let Some(ReloadAck { applied: true, .. }) = reply {
            let mut registry = self.registry().await;
            if let Some(record) = registry.get_mut(bot_id) {
                record.snapshot.settings = settings;
                record.snapshot.revision = revision;
            }
            info!(
                bot_id = %bot_id,
                revision,
                fields = %field_names(&fields).join(", "),
                "Hot reload applied"
            );
            return Ok(HotReloadOutcome::Applied {
                revision,
                fields: field_names(&fields),
            });
        }

        if let Some(record) = self.registry().await.get_mut(bot_id) {
            record.pending_reload = None;
        }
        let reason = match reply {
            Some(ReloadAck { error, .. }) => format!(
                "hot reload rejected: {}",
                error.unwrap_or_else(|| "no reason given".to_string())
            ),
            None => "hot reload not acknowledged".to_string(),
        };
        warn!(bot_id = %bot_id, revision, reason = %reason, "Falling back to restart");
        let pid = self.restart_locked(bot_id, Some(config), &reason).await?;
        Ok(HotReloadOutcome::Restarted { pid, reason })
    }

    /// Hand an inbound webhook update to the bot's worker.
    ///
    /// Returns once the update is queued on the worker's channel.
    ///
    /// # Errors
    ///
    /// `WorkerNotFound` when no worker process is attached for the bot, `Ipc`
    /// when its channel is full or closed.
    pub async fn forward_webhook(&self, bot_id: BotId, payload: String) -> Result<u32> {
        let registry = self.registry().await;
        let handle = registry
            .get(bot_id)
            .filter(|w| matches!(w.status, WorkerStatus::Starting | WorkerStatus::Running))
            .and_then(|w| w.handle.as_ref())
            .ok_or_else(|| Error::worker_not_found(bot_id))?;

        handle
            .outbox
            .try_send(ControllerMessage::WebhookUpdate { payload })
            .map_err(|e| Error::ipc(bot_id, format!("cannot queue update: {e}")))?;
        Ok(handle.pid)
    }

    /// Tell workers to drop cached state. An empty list means every worker.
    pub async fn clear_cache(&self, bot_ids: &[BotId]) -> CacheClearReport {
        let registry = self.registry().await;
        let targets = if bot_ids.is_empty() {
            registry.bot_ids()
        } else {
            bot_ids.iter().copied().unique().collect()
        };

        let mut report = CacheClearReport::default();
        for bot_id in targets {
            let delivered = registry
                .get(bot_id)
                .and_then(|w| w.handle.as_ref())
                .is_some_and(|h| h.outbox.try_send(ControllerMessage::ClearCache).is_ok());
            if delivered {
                report.notified.push(bot_id);
            } else {
                report.missing.push(bot_id);
            }
        }
        report.tap(|r| {
            info!(notified = r.notified.len(), missing = r.missing.len(), "Cache clear sent");
        })
    }

    /// Restart every registered worker, bounded by [`FLEET_CONCURRENCY`].
    pub async fn restart_all(&self, reason: &str) -> RestartAllReport {
        let bot_ids = self.registry().await.bot_ids();
        let results: Vec<(BotId, Result<u32>)> = stream::iter(bot_ids)
            .map(|bot_id| async move { (bot_id, self.restart(bot_id, None, reason).await) })
            .buffer_unordered(FLEET_CONCURRENCY)
            .collect()
            .await;

        let mut report = RestartAllReport::default();
        for (bot_id, result) in results.into_iter().sorted_by_key(|(id, _)| *id) {
            match result {
                Ok(_) => report.restarted.push(bot_id),
                Err(e) => report.failed.push(FailedRestart {
                    bot_id,
                    error: e.to_string(),
                }),
            }
        }
        report.tap(|r| {
            info!(restarted = r.restarted.len(), failed = r.failed.len(), reason, "Fleet restart finished");
        })
    }

    /// Change the ingestion mode and restart workers so they adopt it.
    pub async fn switch_mode(&self, mode: IngestionMode) -> ModeSwitchReport {
        let previous = {
            let mut registry = self.registry().await;
            let previous = registry.mode();
            registry.set_mode(mode);
            previous
        };

        if previous == mode {
            info!(mode = %mode, "Mode unchanged");
            return ModeSwitchReport {
                previous,
                mode,
                changed: false,
                restarted: 0,
                failed: 0,
            };
        }

        info!(from = %previous, to = %mode, "Switching ingestion mode");
        let report = self.restart_all("ingestion mode switch").await;
        ModeSwitchReport {
            previous,
            mode,
            changed: true,
            restarted: report.restarted.len(),
            failed: report.failed.len(),
        }
    }

    /// Purge dead records, expire start locks, and kill orphans.
    pub async fn cleanup(&self) -> CleanupReport {
        let now = Instant::now();
        let (purged, expired_start_locks) = {
            let mut registry = self.registry().await;
            let dead: Vec<BotId> = registry
                .workers()
                .filter(|w| matches!(w.status, WorkerStatus::Crashed | WorkerStatus::Stopped))
                .map(|w| w.bot_id)
                .filter(|id| !registry.policy.is_queued(*id) && !registry.is_busy(*id))
                .collect();
            for bot_id in &dead {
                registry.purge(*bot_id);
            }
            (dead, registry.expire_start_locks(now))
        };

        let orphans_killed = self.kill_orphans().await;
        CleanupReport {
            purged,
            expired_start_locks,
            orphans_killed,
        }
        .tap(|r| {
            info!(
                purged = r.purged.len(),
                expired_locks = r.expired_start_locks.len(),
                orphans = r.orphans_killed.len(),
                "Cleanup finished"
            );
        })
    }

    /// Kill tagged processes whose bot has no record.
    pub async fn kill_orphans(&self) -> Vec<u32> {
        let processes = self
            .processes()
            .scan()
            .await
            .or_default_logged("Orphan scan", Vec::new());
        let registered: BTreeSet<BotId> = self.registry().await.bot_ids().into_iter().collect();

        processes
            .into_iter()
            .filter(|p| !registered.contains(&p.bot_id))
            .filter(|p| matches!(self.processes().signal(p.pid, WorkerSignal::Kill), Ok(true)))
            .map(|p| {
                warn!(bot_id = %p.bot_id, pid = p.pid, "Killed orphan process");
                p.pid
            })
            .collect()
    }

    /// Kill every tagged process and forget every bot.
    pub async fn nuclear_cleanup(&self) -> NuclearReport {
        let (mut pids, cleared) = {
            let mut registry = self.registry().await;
            let pids: BTreeSet<u32> = registry.workers().filter_map(|w| w.pid).collect();
            (pids, registry.clear())
        };
        if let Some(processes) = self
            .processes()
            .scan()
            .await
            .into_option_logged("Nuclear cleanup scan")
        {
            pids.extend(processes.into_iter().map(|p| p.pid));
        }

        let killed: Vec<u32> = pids
            .into_iter()
            .filter(|pid| match self.processes().signal(*pid, WorkerSignal::Kill) {
                Ok(sent) => sent,
                Err(e) => {
                    warn!(pid, error = %e, "Nuclear kill failed");
                    false
                }
            })
            .collect();

        warn!(killed = killed.len(), cleared = cleared.len(), "Nuclear cleanup executed");
        NuclearReport { killed, cleared }
    }
}
