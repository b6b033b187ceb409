//! Core types for the reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_core::{BotId, ConfigSnapshot, DesiredBotConfig, WorkerStatus};
use itertools::Itertools;

use crate::hot_reload::ConfigField;

/// Desired state declaration.
///
/// Holds every configuration the control plane returned, including inactive
/// ones. Only `active` entries should have a running worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    bots: BTreeMap<BotId, DesiredBotConfig>,
}

impl DesiredState {
    /// Create a new empty desired state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a fetched list. A later entry for the same bot wins.
    pub fn from_configs(configs: impl IntoIterator<Item = DesiredBotConfig>) -> Self {
        Self {
            bots: configs.into_iter().map(|c| (c.bot_id, c)).collect(),
        }
    }

    /// Add or replace a bot's configuration.
    pub fn insert(&mut self, config: DesiredBotConfig) {
        self.bots.insert(config.bot_id, config);
    }

    /// Remove a bot from the desired state.
    pub fn remove(&mut self, bot_id: BotId) -> Option<DesiredBotConfig> {
        self.bots.remove(&bot_id)
    }

    #[must_use]
    pub fn get(&self, bot_id: BotId) -> Option<&DesiredBotConfig> {
        self.bots.get(&bot_id)
    }

    /// Configuration for `bot_id` only if it should be running.
    #[must_use]
    pub fn active_config(&self, bot_id: BotId) -> Option<&DesiredBotConfig> {
        self.bots.get(&bot_id).filter(|c| c.active)
    }

    /// Active configurations in bot id order.
    pub fn active(&self) -> impl Iterator<Item = &DesiredBotConfig> {
        self.bots.values().filter(|c| c.active)
    }

    /// Restrict to the given bots, keeping inactive entries.
    #[must_use]
    pub fn restricted_to(&self, bot_ids: &[BotId]) -> Self {
        Self {
            bots: self
                .bots
                .iter()
                .filter(|(id, _)| bot_ids.contains(id))
                .map(|(id, c)| (*id, c.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }
}

/// A worker as seen by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedWorker {
    pub bot_id: BotId,
    pub status: WorkerStatus,
    pub snapshot: ConfigSnapshot,
    /// A restart is queued or executing for this bot, or the restart policy
    /// would refuse one right now.
    pub restart_pending: bool,
}

/// Actual state, taken from the supervisor's registry.
#[derive(Debug, Clone, Default)]
pub struct ActualState {
    pub workers: BTreeMap<BotId, ObservedWorker>,
}

impl ActualState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an observed worker.
    pub fn update(&mut self, worker: ObservedWorker) {
        self.workers.insert(worker.bot_id, worker);
    }

    #[must_use]
    pub fn get(&self, bot_id: BotId) -> Option<&ObservedWorker> {
        self.workers.get(&bot_id)
    }

    /// Workers in a given status.
    #[must_use]
    pub fn in_status(&self, status: WorkerStatus) -> Vec<&ObservedWorker> {
        self.workers
            .values()
            .filter(|w| w.status == status)
            .collect_vec()
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Running)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Actions the reconciler can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Start a worker for an active bot that has none.
    StartWorker { config: DesiredBotConfig },
    /// Stop the worker of a deactivated or removed bot.
    StopWorker { bot_id: BotId, reason: String },
    /// Replace the worker's process.
    RestartWorker {
        config: DesiredBotConfig,
        reason: String,
    },
    /// Push mutable settings to the running worker.
    HotReload {
        config: DesiredBotConfig,
        fields: Vec<ConfigField>,
    },
}

impl ReconcileAction {
    /// Get the bot this action targets.
    #[must_use]
    pub const fn bot_id(&self) -> BotId {
        match self {
            Self::StartWorker { config }
            | Self::RestartWorker { config, .. }
            | Self::HotReload { config, .. } => config.bot_id,
            Self::StopWorker { bot_id, .. } => *bot_id,
        }
    }

    /// Short name for logs and summaries.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StartWorker { .. } => "start",
            Self::StopWorker { .. } => "stop",
            Self::RestartWorker { .. } => "restart",
            Self::HotReload { .. } => "hot_reload",
        }
    }

    /// Get a description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::StartWorker { config } => format!("start bot {}", config.bot_id),
            Self::StopWorker { bot_id, reason } => format!("stop bot {bot_id} ({reason})"),
            Self::RestartWorker { config, reason } => {
                format!("restart bot {} ({reason})", config.bot_id)
            }
            Self::HotReload { config, fields } => format!(
                "hot-reload bot {} ({})",
                config.bot_id,
                fields.iter().map(ConfigField::as_str).join(", ")
            ),
        }
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileResult {
    /// Actions that executed successfully.
    pub actions_taken: Vec<ReconcileAction>,
    /// Actions that failed, with their error text.
    pub actions_failed: Vec<(ReconcileAction, String)>,
    /// Number of active desired bots.
    pub desired_count: usize,
    /// Number of workers in the registry.
    pub actual_count: usize,
    /// No actions were needed.
    pub converged: bool,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileResult {
    #[must_use]
    pub fn new(
        actions_taken: Vec<ReconcileAction>,
        actions_failed: Vec<(ReconcileAction, String)>,
        desired_count: usize,
        actual_count: usize,
    ) -> Self {
        let converged = actions_taken.is_empty() && actions_failed.is_empty();
        Self {
            actions_taken,
            actions_failed,
            desired_count,
            actual_count,
            converged,
            timestamp: Utc::now(),
        }
    }

    /// Bots touched by successful actions of the given kind.
    #[must_use]
    pub fn bots_for(&self, kind: &str) -> Vec<BotId> {
        self.actions_taken
            .iter()
            .filter(|a| a.kind() == kind)
            .map(ReconcileAction::bot_id)
            .collect_vec()
    }
}
