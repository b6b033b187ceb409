//! Heartbeat and memory checks, and the unresponsive-fleet breaker.

#![allow(clippy::unwrap_used)]

mod common;

use std::error::Error;
use std::time::Duration;

use common::{Harness, bot};
use fleet_core::BotId;
use fleet_orchestrator::EmergencyKind;
use fleet_orchestrator::config::FleetConfig;
use fleet_orchestrator::policy::RestartReason;
use fleet_orchestrator::testing::{FakeBehavior, FakeProcessManager};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test(start_paused = true)]
async fn given_silent_worker_when_checked_then_health_restart_enqueued() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(1);
    h.start_running(bot(1)).await.ok_or("worker did not start")?;

    tokio::time::sleep(Duration::from_secs(4)).await;
    let report = h.fleet.health().check_heartbeats().await;

    assert_eq!(report.checked, 1);
    assert_eq!(report.unresponsive, vec![bot_id]);
    assert_eq!(report.restarts_enqueued, vec![bot_id]);
    assert!(!report.fleet_reloaded);
    let reason = h
        .fleet
        .supervisor()
        .with_registry(|r| r.policy.queued(bot_id).map(|e| e.reason))
        .await;
    assert_eq!(reason, Some(RestartReason::HealthTimeout));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_heartbeating_worker_when_checked_then_nothing_happens() -> TestResult {
    let processes = FakeProcessManager::new().with_behavior(FakeBehavior {
        heartbeat_interval: Some(Duration::from_secs(1)),
        ..FakeBehavior::default()
    });
    let h = Harness::with_processes(FleetConfig::for_testing(), processes);
    h.start_running(bot(2)).await.ok_or("worker did not start")?;

    tokio::time::sleep(Duration::from_secs(4)).await;
    let report = h.fleet.health().check_heartbeats().await;

    assert_eq!(report.checked, 1);
    assert!(report.unresponsive.is_empty());
    assert!(report.restarts_enqueued.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_whole_fleet_silent_when_checked_then_fleet_is_reloaded() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    for id in 1..=3 {
        h.start_running(bot(id)).await.ok_or("worker did not start")?;
    }

    tokio::time::sleep(Duration::from_secs(4)).await;
    let report = h.fleet.health().check_heartbeats().await;

    assert!(report.fleet_reloaded);
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].kind, EmergencyKind::UnresponsiveFleet);
    assert!(report.restarts_enqueued.is_empty());

    let delivered = h.alerts.alerts();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].fleet_size, 3);
    for id in 1..=3 {
        assert_eq!(h.processes.spawn_count(BotId::new(id)), 2);
    }
    assert_eq!(h.fleet.health().recent_alerts().await.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_fleet_at_minimum_size_when_silent_then_breaker_stays_closed() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    h.start_running(bot(1)).await.ok_or("worker did not start")?;
    h.start_running(bot(2)).await.ok_or("worker did not start")?;

    tokio::time::sleep(Duration::from_secs(4)).await;
    let report = h.fleet.health().check_heartbeats().await;

    assert!(!report.fleet_reloaded);
    assert!(report.alerts.is_empty());
    assert_eq!(report.restarts_enqueued.len(), 2);
    assert!(h.alerts.alerts().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_worker_over_memory_limit_when_checked_then_resource_restart_enqueued() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let hungry = BotId::new(1);
    let pid = h.start_running(bot(1)).await.ok_or("worker did not start")?;
    let lean = h.start_running(bot(2)).await.ok_or("worker did not start")?;
    h.processes.set_rss(pid, 100 * 1024 * 1024);
    h.processes.set_rss(lean, 10 * 1024 * 1024);

    let report = h.fleet.health().check_memory().await;

    assert_eq!(report.checked, 2);
    assert_eq!(report.over_limit, vec![hungry]);
    let reason = h
        .fleet
        .supervisor()
        .with_registry(|r| r.policy.queued(hungry).map(|e| e.reason))
        .await;
    assert_eq!(reason, Some(RestartReason::ResourceLimit));

    let view = h.fleet.supervisor().worker_view(hungry).await?;
    assert_eq!(view.rss_mb, Some(100));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_worker_that_never_reports_ready_when_grace_expires_then_it_is_restarted()
-> TestResult {
    let processes = FakeProcessManager::new().with_behavior(FakeBehavior {
        auto_ready: false,
        ..FakeBehavior::default()
    });
    let h = Harness::with_processes(FleetConfig::for_testing(), processes);
    let bot_id = BotId::new(1);
    h.desire(bot(1)).await;
    h.fleet.sync_now().await?;
    assert_eq!(h.status(bot_id).await, Some(fleet_core::WorkerStatus::Starting));

    tokio::time::sleep(Duration::from_secs(4)).await;
    let report = h.fleet.health().check_heartbeats().await;

    assert_eq!(report.unresponsive, vec![bot_id]);
    assert_eq!(report.restarts_enqueued, vec![bot_id]);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let executed = h.fleet.supervisor().run_due_restarts().await;

    assert_eq!(executed.len(), 1);
    assert!(executed[0].1.is_ok());
    assert_eq!(h.processes.spawn_count(bot_id), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_worker_inside_start_grace_when_silent_then_restart_waits() -> TestResult {
    let processes = FakeProcessManager::new().with_behavior(FakeBehavior {
        auto_ready: false,
        ..FakeBehavior::default()
    });
    let config = FleetConfig {
        health: fleet_orchestrator::config::HealthConfig::for_testing()
            .with_heartbeat_timeout(Duration::from_millis(100)),
        ..FleetConfig::for_testing()
    };
    let h = Harness::with_processes(config, processes);
    let bot_id = BotId::new(2);
    h.desire(bot(2)).await;
    h.fleet.sync_now().await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let report = h.fleet.health().check_heartbeats().await;

    assert_eq!(report.unresponsive, vec![bot_id]);
    assert!(report.restarts_enqueued.is_empty());
    assert_eq!(h.processes.spawn_count(bot_id), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_restart_storm_when_checked_then_cooldowns_are_widened() -> TestResult {
    let processes = FakeProcessManager::new().with_behavior(FakeBehavior {
        heartbeat_interval: Some(Duration::from_secs(1)),
        ..FakeBehavior::default()
    });
    let h = Harness::with_processes(FleetConfig::for_testing(), processes);
    for id in 1..=3 {
        h.start_running(bot(id)).await.ok_or("worker did not start")?;
    }
    let supervisor = h.fleet.supervisor();
    let base = supervisor
        .with_registry(|r| {
            let now = tokio::time::Instant::now();
            for id in 1..=3 {
                r.policy.record_restart(BotId::new(id), now);
            }
            r.policy.effective_cooldown(now)
        })
        .await;

    let report = h.fleet.health().check_heartbeats().await;

    assert!(!report.fleet_reloaded);
    assert!(report.unresponsive.is_empty());
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts[0].kind, EmergencyKind::RestartStorm);
    assert_eq!(h.alerts.alerts().len(), 1);
    let widened = supervisor
        .with_registry(|r| r.policy.effective_cooldown(tokio::time::Instant::now()))
        .await;
    assert!(widened > base * 2 && widened <= base * 3 + Duration::from_millis(1));

    let again = h.fleet.health().check_heartbeats().await;
    assert!(again.alerts.is_empty());
    Ok(())
}
