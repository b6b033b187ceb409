//! Process reconciliation scanner against a scripted process table.

#![allow(clippy::unwrap_used)]

mod common;

use std::error::Error;

use common::{Harness, bot};
use fleet_core::{BotId, WorkerStatus};
use fleet_orchestrator::config::FleetConfig;
use fleet_orchestrator::process::WorkerSignal;
use fleet_orchestrator::scanner::{Remediation, ScanReport, Verdict};
use fleet_orchestrator::supervisor::Escalation;

type TestResult = Result<(), Box<dyn Error>>;

fn finding_for(report: &ScanReport, bot_id: BotId) -> Option<(Verdict, Option<Remediation>)> {
    report
        .findings
        .iter()
        .find(|f| f.bot_id == bot_id)
        .map(|f| (f.verdict, f.remediation.clone()))
}

#[tokio::test(start_paused = true)]
async fn given_duplicate_process_when_scanned_then_only_the_stray_is_killed() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(21);
    let registered = h.start_running(bot(21)).await.ok_or("worker did not start")?;
    let stray = h.processes.inject_process(bot_id);

    let report = h.fleet.scan_now().await?;

    assert_eq!(
        finding_for(&report, bot_id),
        Some((
            Verdict::DuplicateProcesses,
            Some(Remediation::Killed { pids: vec![stray] })
        ))
    );
    assert_eq!(h.processes.signals(), vec![(stray, WorkerSignal::Kill)]);
    assert_eq!(h.processes.alive(bot_id), vec![registered]);
    assert_eq!(h.status(bot_id).await, Some(WorkerStatus::Running));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_healthy_fleet_when_scanned_then_nothing_is_remediated() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    h.start_running(bot(1)).await.ok_or("worker did not start")?;
    h.start_running(bot(2)).await.ok_or("worker did not start")?;

    let report = h.fleet.scan_now().await?;

    assert_eq!(report.processes_seen, 2);
    assert!(report.findings.iter().all(|f| f.verdict == Verdict::Healthy));
    assert!(h.processes.signals().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_unregistered_tagged_process_when_scanned_then_orphan_is_killed() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(77);
    let orphan = h.processes.inject_process(bot_id);

    let report = h.fleet.scan_now().await?;

    assert_eq!(
        finding_for(&report, bot_id),
        Some((
            Verdict::OrphanProcesses,
            Some(Remediation::Killed { pids: vec![orphan] })
        ))
    );
    assert!(h.processes.alive(bot_id).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_process_hidden_from_scan_when_alive_then_healthy_unconfirmed() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(31);
    let pid = h.start_running(bot(31)).await.ok_or("worker did not start")?;
    h.processes.hide_from_scan(pid);

    let report = h.fleet.scan_now().await?;

    assert_eq!(
        finding_for(&report, bot_id),
        Some((Verdict::HealthyUnconfirmed, Some(Remediation::Logged)))
    );
    assert_eq!(h.status(bot_id).await, Some(WorkerStatus::Running));
    assert!(h.processes.signals().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_vanished_process_when_scanned_then_marked_crashed_and_resynced() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(32);
    let pid = h.start_running(bot(32)).await.ok_or("worker did not start")?;
    h.processes.vanish(pid);

    let report = h.fleet.scan_now().await?;

    assert_eq!(
        finding_for(&report, bot_id),
        Some((Verdict::MissingProcess, Some(Remediation::MarkedCrashed)))
    );
    assert_eq!(h.status(bot_id).await, None);

    let summary = h.fleet.sync_now().await?;
    assert_eq!(summary.started, vec![bot_id]);
    assert_eq!(h.processes.spawn_count(bot_id), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_registered_pid_replaced_when_scanned_then_observed_pid_adopted() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(33);
    let pid = h.start_running(bot(33)).await.ok_or("worker did not start")?;
    h.processes.vanish(pid);
    let replacement = h.processes.inject_process(bot_id);

    let report = h.fleet.scan_now().await?;

    assert_eq!(
        finding_for(&report, bot_id),
        Some((
            Verdict::PidMismatch,
            Some(Remediation::Adopted { pid: replacement })
        ))
    );
    assert_eq!(h.pid(bot_id).await, Some(replacement));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_duplicates_when_inspected_then_nothing_is_killed() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(40);
    h.start_running(bot(40)).await.ok_or("worker did not start")?;
    h.processes.inject_process(bot_id);

    let processes = h.fleet.processes().await?;

    let entry = processes
        .iter()
        .find(|p| p.bot_id == bot_id)
        .ok_or("bot missing from inspection")?;
    assert_eq!(entry.verdict, Some(Verdict::DuplicateProcesses));
    assert_eq!(entry.processes.len(), 2);
    assert!(h.processes.signals().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_starting_worker_when_scanned_then_it_is_left_settling() -> TestResult {
    let processes = fleet_orchestrator::testing::FakeProcessManager::new();
    let bot_id = BotId::new(41);
    processes.set_behavior(
        bot_id,
        fleet_orchestrator::testing::FakeBehavior {
            auto_ready: false,
            ..Default::default()
        },
    );
    let h = Harness::with_processes(FleetConfig::for_testing(), processes);
    h.desire(bot(41)).await;
    h.fleet.sync_now().await?;
    h.processes.inject_process(bot_id);

    let report = h.fleet.scan_now().await?;

    assert_eq!(report.settling, vec![bot_id]);
    assert!(finding_for(&report, bot_id).is_none());
    assert!(h.processes.signals().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_adopted_pid_when_stopped_then_the_adopted_process_is_signalled() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(34);
    let pid = h.start_running(bot(34)).await.ok_or("worker did not start")?;
    h.processes.vanish(pid);
    let replacement = h.processes.inject_process(bot_id);
    h.fleet.scan_now().await?;

    let report = h.fleet.supervisor().stop(bot_id).await?;

    assert_eq!(report.pid, Some(replacement));
    assert_eq!(report.escalation, Escalation::Terminated);
    assert!(h.processes.signals().contains(&(replacement, WorkerSignal::Terminate)));
    assert!(h.processes.alive(bot_id).is_empty());
    assert!(h.processes.received(pid).is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn given_duplicates_and_registered_gone_when_scanned_then_restart_requested() -> TestResult {
    let h = Harness::new(FleetConfig::for_testing());
    let bot_id = BotId::new(35);
    let pid = h.start_running(bot(35)).await.ok_or("worker did not start")?;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    h.processes.vanish(pid);
    let first = h.processes.inject_process(bot_id);
    let second = h.processes.inject_process(bot_id);

    let report = h.fleet.scan_now().await?;

    assert_eq!(
        finding_for(&report, bot_id),
        Some((
            Verdict::DuplicateProcesses,
            Some(Remediation::KilledAndRestartRequested {
                pids: vec![first, second],
                enqueued: true,
            })
        ))
    );
    let queued = h
        .fleet
        .supervisor()
        .with_registry(|r| r.policy.is_queued(bot_id))
        .await;
    assert!(queued);
    assert!(h.processes.alive(bot_id).is_empty());
    Ok(())
}
