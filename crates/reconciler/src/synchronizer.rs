//! Desired-state synchronizer.
//!
//! One pass fetches the desired configuration, snapshots the registry and
//! hands both to the [`Reconciler`]. A failed fetch skips the pass entirely:
//! nothing is started or stopped on the strength of a partial or missing list.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::reconciler::Reconciler;
use crate::types::{ActualState, DesiredState, ReconcileResult};

/// Source of the desired configuration.
#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    /// Fetch the full desired state.
    async fn fetch(&self) -> Result<DesiredState>;
}

/// Source of the current fleet state.
#[async_trait]
pub trait ActualStateProvider: Send + Sync {
    /// Snapshot of every worker in the registry.
    async fn actual_state(&self) -> ActualState;
}

/// In-memory desired state, for embedding and tests.
pub struct InMemoryDesiredStateProvider {
    state: RwLock<DesiredState>,
    unavailable: RwLock<bool>,
}

impl InMemoryDesiredStateProvider {
    #[must_use]
    pub fn new(initial: DesiredState) -> Self {
        Self {
            state: RwLock::new(initial),
            unavailable: RwLock::new(false),
        }
    }

    /// Replace the desired state.
    pub async fn set(&self, state: DesiredState) {
        *self.state.write().await = state;
    }

    /// Mutate the desired state in place.
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut DesiredState),
    {
        let mut guard = self.state.write().await;
        f(&mut guard);
    }

    /// Make subsequent fetches fail.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }
}

#[async_trait]
impl DesiredStateProvider for InMemoryDesiredStateProvider {
    async fn fetch(&self) -> Result<DesiredState> {
        if *self.unavailable.read().await {
            return Err(Error::fetch_failed("desired state source unavailable"));
        }
        Ok(self.state.read().await.clone())
    }
}

/// Counters for the synchronizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub passes: u64,
    pub failed_fetches: u64,
    pub last_success: Option<DateTime<Utc>>,
}

/// Drives reconciliation passes against the control plane.
pub struct Synchronizer {
    reconciler: Arc<Reconciler>,
    desired: Arc<dyn DesiredStateProvider>,
    actual: Arc<dyn ActualStateProvider>,
    last_desired: RwLock<Option<DesiredState>>,
    stats: RwLock<SyncStats>,
}

impl Synchronizer {
    pub fn new(
        reconciler: Arc<Reconciler>,
        desired: Arc<dyn DesiredStateProvider>,
        actual: Arc<dyn ActualStateProvider>,
    ) -> Self {
        Self {
            reconciler,
            desired,
            actual,
            last_desired: RwLock::new(None),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Run a single pass.
    ///
    /// # Errors
    ///
    /// Returns `FetchFailed` when the desired state could not be fetched. No
    /// action was applied in that case.
    pub async fn sync_once(&self) -> Result<ReconcileResult> {
        let desired = self.fetch_desired().await?;
        let actual = self.actual.actual_state().await;
        let result = self.reconciler.reconcile(&desired, &actual).await;

        let mut stats = self.stats.write().await;
        stats.passes = stats.passes.saturating_add(1);
        stats.last_success = Some(result.timestamp);

        Ok(result)
    }

    /// Run a pass restricted to the given bots. Workers of other bots are
    /// left alone even when the desired state no longer lists them.
    ///
    /// # Errors
    ///
    /// Returns `FetchFailed` when the desired state could not be fetched.
    pub async fn sync_bots(&self, bot_ids: &[fleet_core::BotId]) -> Result<ReconcileResult> {
        let desired = self.fetch_desired().await?.restricted_to(bot_ids);
        let mut actual = self.actual.actual_state().await;
        actual.workers.retain(|id, _| bot_ids.contains(id));

        debug!(bots = bot_ids.len(), "Targeted sync");
        Ok(self.reconciler.reconcile(&desired, &actual).await)
    }

    /// Fetch the desired state and cache it as the last good copy.
    ///
    /// # Errors
    ///
    /// Returns the provider's error after counting it.
    pub async fn fetch_desired(&self) -> Result<DesiredState> {
        match self.desired.fetch().await {
            Ok(desired) => {
                debug!(
                    bots = desired.len(),
                    active = desired.active_count(),
                    "Fetched desired state"
                );
                *self.last_desired.write().await = Some(desired.clone());
                Ok(desired)
            }
            Err(e) => {
                let mut stats = self.stats.write().await;
                stats.failed_fetches = stats.failed_fetches.saturating_add(1);
                warn!(error = %e, "Desired state fetch failed, skipping sync pass");
                Err(e)
            }
        }
    }

    /// Last successfully fetched desired state, if any.
    pub async fn last_desired(&self) -> Option<DesiredState> {
        self.last_desired.read().await.clone()
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.read().await.clone()
    }

    /// Log a one-line summary of a pass.
    pub fn log_result(result: &ReconcileResult) {
        if !result.converged {
            info!(
                started = result.bots_for("start").len(),
                stopped = result.bots_for("stop").len(),
                restarted = result.bots_for("restart").len(),
                reloaded = result.bots_for("hot_reload").len(),
                failed = result.actions_failed.len(),
                "Sync pass applied changes"
            );
        }
    }
}
