//! BDD test: the control loop drives synchronization, and graceful shutdown
//! stops it before stopping every worker.
//!
//! **Scenario:** GIVEN a running control loop WHEN shutdown is initiated
//! THEN the loop stops first and no worker survives

#![allow(clippy::unwrap_used)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, bot};
use fleet_core::{BotId, WorkerStatus};
use fleet_orchestrator::config::FleetConfig;
use fleet_orchestrator::shutdown::{ShutdownPhase, wait_for_signal};
use fleet_orchestrator::testing::{FakeBehavior, FakeProcessManager};
use fleet_orchestrator::{ShutdownCoordinator, ShutdownSignal};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test(start_paused = true)]
async fn given_control_loop_when_bot_desired_then_worker_started_without_manual_sync() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(1);
    h.desire(bot(1)).await;

    h.fleet.spawn_control_loop().await?;
    assert!(h.fleet.control_loop_running().await);
    assert!(h.wait_for_status(bot_id, WorkerStatus::Running).await);

    h.fleet.stop_control_loop().await;
    assert!(!h.fleet.control_loop_running().await);
    assert_eq!(h.processes.spawn_count(bot_id), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_running_fleet_when_shutdown_then_loop_and_workers_stop() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    for id in 1..=3 {
        h.desire(bot(id)).await;
    }
    h.fleet.spawn_control_loop().await?;
    for id in 1..=3 {
        assert!(h.wait_for_status(BotId::new(id), WorkerStatus::Running).await);
    }

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let receiver = coordinator.subscribe();
    coordinator.initiate_shutdown(ShutdownSignal::Sigterm);
    assert_eq!(wait_for_signal(receiver).await, ShutdownSignal::Sigterm);

    let stats = coordinator.wait_with_timeout(&h.fleet).await?;

    assert_eq!(stats.workers_stopped, 3);
    assert_eq!(stats.workers_escalated, 0);
    assert_eq!(coordinator.phase(), ShutdownPhase::Complete);
    assert!(!h.fleet.control_loop_running().await);
    assert_eq!(h.fleet.supervisor().counts().await.total, 0);
    for id in 1..=3 {
        assert!(h.processes.alive(BotId::new(id)).is_empty());
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_stubborn_worker_when_shutdown_then_it_is_killed_within_deadline() -> TestResult {
    let processes = FakeProcessManager::new().with_behavior(FakeBehavior::stubborn());
    let h = Harness::with_processes(FleetConfig::for_testing(), processes);
    let bot_id = BotId::new(9);
    h.start_running(bot(9)).await.ok_or("worker did not start")?;

    let coordinator = ShutdownCoordinator::new();
    let stats = coordinator
        .shutdown_within(&h.fleet, Duration::from_secs(5))
        .await?;

    assert_eq!(stats.workers_stopped, 1);
    assert_eq!(stats.workers_escalated, 1);
    assert!(h.processes.alive(bot_id).is_empty());
    Ok(())
}
