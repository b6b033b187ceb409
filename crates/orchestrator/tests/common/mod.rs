//! Shared fixtures: a fleet wired to fake processes and in-memory desired state.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_core::{BotId, DesiredBotConfig, MutableSettings, WorkerStatus};
use fleet_reconciler::{DesiredState, InMemoryDesiredStateProvider};
use fleet_orchestrator::config::FleetConfig;
use fleet_orchestrator::testing::{FakeProcessManager, RecordingAlertSink};
use fleet_orchestrator::Fleet;

pub struct Harness {
    pub fleet: Fleet,
    pub processes: FakeProcessManager,
    pub desired: Arc<InMemoryDesiredStateProvider>,
    pub alerts: RecordingAlertSink,
}

impl Harness {
    pub fn new(config: FleetConfig) -> Self {
        Self::with_processes(config, FakeProcessManager::new())
    }

    pub fn with_processes(config: FleetConfig, processes: FakeProcessManager) -> Self {
        let desired = Arc::new(InMemoryDesiredStateProvider::new(DesiredState::new()));
        let alerts = RecordingAlertSink::new();
        let fleet = Fleet::new(
            config,
            Arc::new(processes.clone()),
            desired.clone(),
            None,
            vec![Arc::new(alerts.clone())],
        );
        Self {
            fleet,
            processes,
            desired,
            alerts,
        }
    }

    /// Insert or replace a bot in the desired state.
    pub async fn desire(&self, config: DesiredBotConfig) {
        self.desired.update(|state| state.insert(config)).await;
    }

    pub async fn status(&self, bot_id: BotId) -> Option<WorkerStatus> {
        self.fleet
            .supervisor()
            .with_registry(|r| r.get(bot_id).map(|w| w.status))
            .await
    }

    pub async fn pid(&self, bot_id: BotId) -> Option<u32> {
        self.fleet
            .supervisor()
            .with_registry(|r| r.get(bot_id).and_then(|w| w.pid))
            .await
    }

    /// Poll until the bot reaches `status`, giving up after two seconds.
    pub async fn wait_for_status(&self, bot_id: BotId, status: WorkerStatus) -> bool {
        for _ in 0..200 {
            if self.status(bot_id).await == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Sync once and wait for `bot_id` to report in.
    pub async fn start_running(&self, config: DesiredBotConfig) -> Option<u32> {
        let bot_id = config.bot_id;
        self.desire(config).await;
        self.fleet.sync_now().await.ok()?;
        if !self.wait_for_status(bot_id, WorkerStatus::Running).await {
            return None;
        }
        self.pid(bot_id).await
    }
}

pub fn bot(id: u64) -> DesiredBotConfig {
    DesiredBotConfig::new(BotId::new(id), format!("token-{id}"), format!("asst-{id}"))
}

pub fn settings(prompt: &str) -> MutableSettings {
    MutableSettings {
        prompt: prompt.to_string(),
        model: "gpt-test".to_string(),
        display_name: "Test Bot".to_string(),
    }
}
