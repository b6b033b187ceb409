//! Reconciler implementation.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::WorkerStatus;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::hot_reload::{ConfigDelta, classify};
use crate::types::{ActualState, DesiredState, ReconcileAction, ReconcileResult};

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound on `StartWorker` actions per pass, so a cold start of a
    /// large fleet ramps up over several intervals.
    pub max_starts_per_pass: usize,
    /// Ask for a restart of crashed workers whose bot is still desired.
    pub restart_crashed: bool,
    /// Actions applied concurrently. Each action targets a distinct bot.
    pub parallelism: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_starts_per_pass: 100,
            restart_crashed: true,
            parallelism: 16,
        }
    }
}

/// Trait for executing reconcile actions.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute an action.
    async fn execute(&self, action: &ReconcileAction) -> Result<()>;
}

/// Desired-vs-actual reconciler for the worker fleet.
pub struct Reconciler {
    executor: Arc<dyn ActionExecutor>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(executor: Arc<dyn ActionExecutor>, config: ReconcilerConfig) -> Self {
        Self { executor, config }
    }

    /// Compare desired vs actual and apply the resulting actions.
    pub async fn reconcile(&self, desired: &DesiredState, actual: &ActualState) -> ReconcileResult {
        info!(
            desired = desired.active_count(),
            actual = actual.len(),
            running = actual.running_count(),
            "Starting reconciliation"
        );

        let actions = self.diff(desired, actual);
        debug!(actions = actions.len(), "Generated actions");

        let (taken, failed) = self.apply_actions(actions).await;
        let result = ReconcileResult::new(taken, failed, desired.active_count(), actual.len());

        if result.converged {
            debug!("Fleet converged");
        } else {
            info!(
                actions_taken = result.actions_taken.len(),
                actions_failed = result.actions_failed.len(),
                "Reconciliation complete"
            );
        }

        result
    }

    /// Compute the actions that move `actual` towards `desired`.
    ///
    /// Pure: running it twice over the same inputs yields the same list, and
    /// a registry that already matches the desired state yields none.
    pub fn diff(&self, desired: &DesiredState, actual: &ActualState) -> Vec<ReconcileAction> {
        let mut actions = Vec::new();
        let mut starts = 0usize;

        // 1. Active bots: start missing workers, reconcile existing ones
        for config in desired.active() {
            match actual.get(config.bot_id) {
                None => {
                    if starts < self.config.max_starts_per_pass {
                        starts = starts.saturating_add(1);
                        actions.push(ReconcileAction::StartWorker {
                            config: config.clone(),
                        });
                    }
                }
                Some(worker) if worker.restart_pending => {}
                Some(worker) => match worker.status {
                    WorkerStatus::Crashed if self.config.restart_crashed => {
                        actions.push(ReconcileAction::RestartWorker {
                            config: config.clone(),
                            reason: "crashed".to_string(),
                        });
                    }
                    WorkerStatus::Running => match classify(&worker.snapshot, config) {
                        ConfigDelta::Unchanged => {}
                        ConfigDelta::Mutable { fields, .. } => {
                            actions.push(ReconcileAction::HotReload {
                                config: config.clone(),
                                fields,
                            });
                        }
                        ConfigDelta::Critical { fields } => {
                            let names: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
                            actions.push(ReconcileAction::RestartWorker {
                                config: config.clone(),
                                reason: format!("critical config change: {}", names.join(", ")),
                            });
                        }
                    },
                    // Starting workers are reconciled once they report in;
                    // stopping/stopped ones are already on their way out.
                    _ => {}
                },
            }
        }

        // 2. Workers whose bot is gone or deactivated
        for (bot_id, worker) in &actual.workers {
            if desired.active_config(*bot_id).is_some() {
                continue;
            }
            if matches!(worker.status, WorkerStatus::Stopping | WorkerStatus::Stopped) {
                continue;
            }
            let reason = if desired.get(*bot_id).is_some() {
                "deactivated"
            } else {
                "removed from desired state"
            };
            actions.push(ReconcileAction::StopWorker {
                bot_id: *bot_id,
                reason: reason.to_string(),
            });
        }

        actions
    }

    /// Apply actions with bounded concurrency.
    async fn apply_actions(
        &self,
        actions: Vec<ReconcileAction>,
    ) -> (Vec<ReconcileAction>, Vec<(ReconcileAction, String)>) {
        let outcomes: Vec<(ReconcileAction, Result<()>)> = stream::iter(actions)
            .map(|action| async move {
                debug!(action = %action.description(), "Applying action");
                let outcome = self.executor.execute(&action).await;
                (action, outcome)
            })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await;

        let mut taken = Vec::new();
        let mut failed = Vec::new();
        for (action, outcome) in outcomes {
            match outcome {
                Ok(()) => taken.push(action),
                Err(e) => {
                    warn!(action = %action.description(), error = %e, "Action failed");
                    failed.push((action, e.to_string()));
                }
            }
        }

        (taken, failed)
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    executor: Option<Arc<dyn ActionExecutor>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the action executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Cap starts per pass.
    #[must_use]
    pub const fn max_starts_per_pass(mut self, max: usize) -> Self {
        self.config.max_starts_per_pass = max;
        self
    }

    /// Enable/disable restart requests for crashed workers.
    #[must_use]
    pub const fn restart_crashed(mut self, enabled: bool) -> Self {
        self.config.restart_crashed = enabled;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when no executor was supplied or parallelism is zero.
    pub fn build(self) -> Result<Reconciler> {
        let executor = self
            .executor
            .ok_or_else(|| Error::invalid_config("action executor is required"))?;
        if self.config.parallelism == 0 {
            return Err(Error::invalid_config("parallelism must be at least 1"));
        }
        Ok(Reconciler::new(executor, self.config))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::hot_reload::ConfigField;
    use crate::types::ObservedWorker;
    use fleet_core::{BotId, DesiredBotConfig};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<ReconcileAction>>,
        fail_starts: bool,
    }

    #[async_trait]
    impl ActionExecutor for RecordingExecutor {
        async fn execute(&self, action: &ReconcileAction) -> Result<()> {
            if self.fail_starts && matches!(action, ReconcileAction::StartWorker { .. }) {
                return Err(Error::action_failed(action.description(), "fleet limit reached"));
            }
            self.executed.lock().unwrap().push(action.clone());
            Ok(())
        }
    }

    fn config(id: u64) -> DesiredBotConfig {
        DesiredBotConfig::new(BotId::new(id), "tok", "asst")
    }

    fn observed(config: &DesiredBotConfig, status: WorkerStatus) -> ObservedWorker {
        ObservedWorker {
            bot_id: config.bot_id,
            status,
            snapshot: config.snapshot(),
            restart_pending: false,
        }
    }

    fn reconciler_with(executor: Arc<RecordingExecutor>) -> Reconciler {
        Reconciler::new(executor, ReconcilerConfig::default())
    }

    #[tokio::test]
    async fn test_reconcile_empty() {
        let reconciler = reconciler_with(Arc::new(RecordingExecutor::default()));
        let result = reconciler
            .reconcile(&DesiredState::new(), &ActualState::new())
            .await;
        assert!(result.converged);
    }

    #[test]
    fn test_diff_starts_missing_workers() {
        let reconciler = reconciler_with(Arc::new(RecordingExecutor::default()));
        let desired = DesiredState::from_configs([config(42)]);

        let actions = reconciler.diff(&desired, &ActualState::new());

        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ReconcileAction::StartWorker { config } if config.bot_id == BotId::new(42)));
    }

    #[test]
    fn test_diff_ignores_inactive_and_stops_deactivated() {
        let reconciler = reconciler_with(Arc::new(RecordingExecutor::default()));
        let running = config(7);
        let desired = DesiredState::from_configs([running.clone().with_active(false), config(8).with_active(false)]);
        let mut actual = ActualState::new();
        actual.update(observed(&running, WorkerStatus::Running));

        let actions = reconciler.diff(&desired, &actual);

        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ReconcileAction::StopWorker { bot_id, reason } if *bot_id == BotId::new(7) && reason == "deactivated"));
    }

    #[test]
    fn test_diff_classifies_config_changes() {
        let reconciler = reconciler_with(Arc::new(RecordingExecutor::default()));
        let prompt_bot = config(1);
        let token_bot = config(2);
        let mut actual = ActualState::new();
        actual.update(observed(&prompt_bot, WorkerStatus::Running));
        actual.update(observed(&token_bot, WorkerStatus::Running));

        let mut new_prompt = prompt_bot.clone();
        new_prompt.settings.prompt = "new prompt".to_string();
        let mut new_token = token_bot.clone();
        new_token.external_token = "rotated".to_string();
        let desired = DesiredState::from_configs([new_prompt, new_token]);

        let actions = reconciler.diff(&desired, &actual);

        assert_eq!(actions.len(), 2);
        assert!(actions.iter().any(|a| matches!(a, ReconcileAction::HotReload { fields, .. } if fields == &vec![ConfigField::Prompt])));
        assert!(actions.iter().any(|a| matches!(a, ReconcileAction::RestartWorker { config, .. } if config.bot_id == BotId::new(2))));
    }

    #[test]
    fn test_diff_skips_starting_and_pending_restart() {
        let reconciler = reconciler_with(Arc::new(RecordingExecutor::default()));
        let starting = config(1);
        let crashed = config(2);
        let mut actual = ActualState::new();
        actual.update(observed(&starting, WorkerStatus::Starting));
        let mut pending = observed(&crashed, WorkerStatus::Crashed);
        pending.restart_pending = true;
        actual.update(pending);

        let desired = DesiredState::from_configs([starting, crashed]);
        assert!(reconciler.diff(&desired, &actual).is_empty());
    }

    #[test]
    fn test_diff_respects_start_cap() {
        let reconciler = ReconcilerBuilder::new()
            .with_executor(Arc::new(RecordingExecutor::default()))
            .max_starts_per_pass(2)
            .build()
            .unwrap();
        let desired = DesiredState::from_configs((1..=5).map(config));

        let actions = reconciler.diff(&desired, &ActualState::new());
        assert_eq!(actions.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_actions_are_reported_not_fatal() {
        let executor = Arc::new(RecordingExecutor {
            fail_starts: true,
            ..Default::default()
        });
        let reconciler = reconciler_with(executor.clone());
        let stale = config(9);
        let mut actual = ActualState::new();
        actual.update(observed(&stale, WorkerStatus::Running));
        let desired = DesiredState::from_configs([config(1)]);

        let result = reconciler.reconcile(&desired, &actual).await;

        assert_eq!(result.actions_failed.len(), 1);
        assert_eq!(result.bots_for("stop"), vec![BotId::new(9)]);
        assert!(!result.converged);
    }

    #[test]
    fn test_builder_requires_executor() {
        assert!(ReconcilerBuilder::new().build().is_err());
    }
}
