//! Read-only views of the registry for the control surface.
//!
//! Views never expose credentials: only the mutable settings that are safe to
//! show (display name, model) leave the registry.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_core::{BotId, Error, IngestionMode, Result, WorkerStatus};
use serde::Serialize;
use tokio::time::Instant;

use crate::alerts::EmergencyKind;
use crate::policy::{EmergencyState, RestartHistory, RestartQueueEntry};
use crate::process::ExitInfo;
use crate::registry::{LogLine, ProcessTracker, Registry, WorkerRecord};
use crate::supervisor::Supervisor;

const BYTES_PER_MB: u64 = 1024 * 1024;

fn utc_ago(now: Instant, then: Instant) -> DateTime<Utc> {
    let elapsed = now.saturating_duration_since(then);
    Utc::now() - ChronoDuration::from_std(elapsed).unwrap_or_else(|_| ChronoDuration::zero())
}

/// One worker, as listed by `GET /workers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub bot_id: BotId,
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub last_heartbeat_age_secs: Option<u64>,
    pub rss_mb: Option<u64>,
    pub display_name: String,
    pub model: String,
}

impl WorkerView {
    #[must_use]
    pub fn from_record(record: &WorkerRecord, now: Instant) -> Self {
        Self {
            bot_id: record.bot_id,
            pid: record.pid,
            status: record.status,
            started_at: record.started_at,
            uptime_secs: now.saturating_duration_since(record.started).as_secs(),
            last_heartbeat_age_secs: record
                .last_heartbeat
                .map(|t| now.saturating_duration_since(t).as_secs()),
            rss_mb: record.rss_bytes.map(|b| b / BYTES_PER_MB),
            display_name: record.snapshot.settings.display_name.clone(),
            model: record.snapshot.settings.model.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryView {
    pub count: u32,
    pub last_hour: usize,
    pub last_restart_at: Option<DateTime<Utc>>,
}

impl HistoryView {
    fn new(history: &RestartHistory, now: Instant) -> Self {
        Self {
            count: history.count,
            last_hour: history.last_hour(now),
            last_restart_at: history.last_restart_at.map(|t| utc_ago(now, t)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntryView {
    pub bot_id: BotId,
    pub reason: &'static str,
    pub attempt: u32,
    pub delay_ms: u128,
    pub enqueued_at: DateTime<Utc>,
    /// Milliseconds until the entry may run.
    pub ready_in_ms: u128,
}

impl QueueEntryView {
    fn new(entry: &RestartQueueEntry, now: Instant) -> Self {
        Self {
            bot_id: entry.bot_id,
            reason: entry.reason.as_str(),
            attempt: entry.attempt,
            delay_ms: entry.delay.as_millis(),
            enqueued_at: entry.enqueued_at_utc,
            ready_in_ms: entry.ready_at.saturating_duration_since(now).as_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyView {
    pub kind: EmergencyKind,
    pub cooldown_multiplier: f64,
    pub activated_at: DateTime<Utc>,
    pub expires_in_secs: u64,
    pub reason: String,
}

impl EmergencyView {
    fn new(state: &EmergencyState, now: Instant) -> Self {
        Self {
            kind: state.kind,
            cooldown_multiplier: state.cooldown_multiplier,
            activated_at: state.activated_at_utc,
            expires_in_secs: state.expires_at.saturating_duration_since(now).as_secs(),
            reason: state.reason.clone(),
        }
    }
}

/// `GET /workers/:id/detailed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerDetail {
    #[serde(flatten)]
    pub worker: WorkerView,
    pub tracker: Option<ProcessTracker>,
    pub restart_history: Option<HistoryView>,
    pub queued_restart: Option<QueueEntryView>,
    pub start_lock_remaining_ms: Option<u128>,
    pub config_revision: u64,
    pub last_exit: Option<ExitInfo>,
    pub log_lines: usize,
}

/// `GET /workers/restarts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartsView {
    pub restarts_last_hour: usize,
    pub history: BTreeMap<BotId, HistoryView>,
    pub queue: Vec<QueueEntryView>,
    pub emergency: Option<EmergencyView>,
}

/// Worker counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetCounts {
    pub total: usize,
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub crashed: usize,
}

impl FleetCounts {
    fn count(registry: &Registry) -> Self {
        registry.workers().fold(
            Self {
                total: registry.len(),
                ..Self::default()
            },
            |mut counts, w| {
                match w.status {
                    WorkerStatus::Starting => counts.starting += 1,
                    WorkerStatus::Running => counts.running += 1,
                    WorkerStatus::Stopping => counts.stopping += 1,
                    WorkerStatus::Stopped => counts.stopped += 1,
                    WorkerStatus::Crashed => counts.crashed += 1,
                }
                counts
            },
        )
    }
}

/// `GET /status`, minus the sync timestamp which the fleet adds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub uptime_secs: u64,
    pub mode: IngestionMode,
    pub fleet_size: usize,
    pub by_status: FleetCounts,
    pub queued_restarts: usize,
    pub emergency: Option<EmergencyView>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Fleet-level figures for `GET /metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetMetrics {
    pub workers: FleetCounts,
    pub restarts_last_hour: usize,
    pub queued_restarts: usize,
    pub emergency_active: bool,
    pub average_rss_mb: Option<f64>,
}

impl Supervisor {
    pub async fn worker_views(&self) -> Vec<WorkerView> {
        let now = Instant::now();
        self.registry()
            .await
            .workers()
            .map(|w| WorkerView::from_record(w, now))
            .collect()
    }

    /// # Errors
    ///
    /// `WorkerNotFound` when the bot has no record.
    pub async fn worker_view(&self, bot_id: BotId) -> Result<WorkerView> {
        let now = Instant::now();
        self.registry()
            .await
            .get(bot_id)
            .map(|w| WorkerView::from_record(w, now))
            .ok_or_else(|| Error::worker_not_found(bot_id))
    }

    /// # Errors
    ///
    /// `WorkerNotFound` when the bot has no record.
    pub async fn worker_detail(&self, bot_id: BotId) -> Result<WorkerDetail> {
        let now = Instant::now();
        let registry = self.registry().await;
        let record = registry
            .get(bot_id)
            .ok_or_else(|| Error::worker_not_found(bot_id))?;

        Ok(WorkerDetail {
            worker: WorkerView::from_record(record, now),
            tracker: registry.tracker(bot_id).cloned(),
            restart_history: registry
                .policy
                .history(bot_id)
                .map(|h| HistoryView::new(h, now)),
            queued_restart: registry
                .policy
                .queued(bot_id)
                .map(|e| QueueEntryView::new(e, now)),
            start_lock_remaining_ms: registry
                .start_lock_remaining(bot_id, now)
                .map(|d| d.as_millis()),
            config_revision: record.snapshot.revision,
            last_exit: record.last_exit,
            log_lines: record.logs.len(),
        })
    }

    /// The last `lines` log lines of a worker, oldest first.
    ///
    /// # Errors
    ///
    /// `WorkerNotFound` when the bot has no record.
    pub async fn logs(&self, bot_id: BotId, lines: usize) -> Result<Vec<LogLine>> {
        self.registry()
            .await
            .get(bot_id)
            .map(|w| w.logs.tail(lines))
            .ok_or_else(|| Error::worker_not_found(bot_id))
    }

    pub async fn restarts_view(&self) -> RestartsView {
        let now = Instant::now();
        let mut registry = self.registry().await;
        let restarts_last_hour = registry.policy.restarts_last_hour(now);
        let emergency = registry
            .policy
            .emergency(now)
            .map(|e| EmergencyView::new(e, now));

        RestartsView {
            restarts_last_hour,
            history: registry
                .policy
                .histories()
                .map(|(id, h)| (*id, HistoryView::new(h, now)))
                .collect(),
            queue: registry
                .policy
                .queue()
                .map(|e| QueueEntryView::new(e, now))
                .collect(),
            emergency,
        }
    }

    pub async fn counts(&self) -> FleetCounts {
        FleetCounts::count(&*self.registry().await)
    }

    pub async fn status_view(&self) -> StatusView {
        let now = Instant::now();
        let mut registry = self.registry().await;
        let emergency = registry
            .policy
            .emergency(now)
            .map(|e| EmergencyView::new(e, now));

        StatusView {
            uptime_secs: self.uptime().as_secs(),
            mode: registry.mode(),
            fleet_size: registry.len(),
            by_status: FleetCounts::count(&registry),
            queued_restarts: registry.policy.queue_len(),
            emergency,
            last_sync: None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub async fn metrics(&self) -> FleetMetrics {
        let now = Instant::now();
        let mut registry = self.registry().await;
        let restarts_last_hour = registry.policy.restarts_last_hour(now);
        let emergency_active = registry.policy.emergency(now).is_some();
        let rss: Vec<u64> = registry.workers().filter_map(|w| w.rss_bytes).collect();
        let average_rss_mb = (!rss.is_empty()).then(|| {
            rss.iter().sum::<u64>() as f64 / rss.len() as f64 / BYTES_PER_MB as f64
        });

        FleetMetrics {
            workers: FleetCounts::count(&registry),
            restarts_last_hour,
            queued_restarts: registry.policy.queue_len(),
            emergency_active,
            average_rss_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::time::Duration;

    use super::*;
    use fleet_core::{DesiredBotConfig, MutableSettings};

    fn running_record(id: u64) -> WorkerRecord {
        let config = DesiredBotConfig::new(BotId::new(id), "secret-token", "asst").with_settings(
            MutableSettings {
                prompt: "be nice".to_string(),
                model: "m-1".to_string(),
                display_name: "Helper".to_string(),
            },
        );
        let mut record = WorkerRecord::new(config.bot_id, config.snapshot(), 5);
        record.transition(WorkerStatus::Starting).unwrap();
        record.transition(WorkerStatus::Running).unwrap();
        record
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_view_hides_credentials() {
        let mut record = running_record(7);
        record.pid = Some(4242);
        record.rss_bytes = Some(300 * BYTES_PER_MB);
        tokio::time::advance(Duration::from_secs(12)).await;
        record.last_heartbeat = Some(Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;

        let view = WorkerView::from_record(&record, Instant::now());

        assert_eq!(view.uptime_secs, 15);
        assert_eq!(view.last_heartbeat_age_secs, Some(3));
        assert_eq!(view.rss_mb, Some(300));
        assert_eq!(view.display_name, "Helper");
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("secret-token"));
        assert!(!json.contains("be nice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_by_status() {
        let mut registry = Registry::new(
            crate::policy::RestartPolicy::new(
                crate::config::RestartConfig::default(),
                crate::config::EmergencyConfig::default(),
            ),
            IngestionMode::Polling,
        );
        registry.insert(running_record(1));
        registry.insert(running_record(2));
        let mut crashed = running_record(3);
        crashed.transition(WorkerStatus::Crashed).unwrap();
        registry.insert(crashed);

        let counts = FleetCounts::count(&registry);
        assert_eq!(counts.total, 3);
        assert_eq!(counts.running, 2);
        assert_eq!(counts.crashed, 1);
    }
}
