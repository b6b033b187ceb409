//! Process Reconciliation Scanner.
//!
//! Reads the process table on its own schedule, independent of what the
//! supervisor believes, and repairs divergence between the two.
//!
//! Bots with a lifecycle operation in flight (start lock held, operation lock
//! taken, or status `starting`/`stopping`) are left out of a cycle: their
//! process table entries are legitimately in motion.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fleet_core::{BotId, Result, WorkerStatus};
use itertools::Itertools;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::policy::RestartReason;
use crate::process::{TaggedProcess, WorkerSignal, top_level};
use crate::supervisor::Supervisor;

/// Classification of one bot after a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Exactly one observed pid and it is the registered one.
    Healthy,
    /// Registered pid absent from the scan but alive by direct probe.
    HealthyUnconfirmed,
    /// Registered as running, no process observed or alive.
    MissingProcess,
    /// More than one top-level process for the bot.
    DuplicateProcesses,
    /// One process, not the registered pid.
    PidMismatch,
    /// Processes with no registry entry expecting them.
    OrphanProcesses,
}

impl Verdict {
    #[must_use]
    pub const fn needs_remediation(&self) -> bool {
        !matches!(self, Self::Healthy | Self::HealthyUnconfirmed)
    }
}

/// Classify one bot.
///
/// `registered` is the pid of a `running` record, `None` when no record
/// expects a process. `is_alive` is only consulted when the registered pid is
/// absent from the scan, since tag-based enumeration can under-report.
///
/// Returns `None` when there is nothing to report.
pub fn classify(
    registered: Option<u32>,
    observed: &BTreeSet<u32>,
    is_alive: impl FnOnce(u32) -> bool,
) -> Option<Verdict> {
    let verdict = match (registered, observed.len()) {
        (None, 0) => return None,
        (None, _) => Verdict::OrphanProcesses,
        (Some(pid), 0) if is_alive(pid) => Verdict::HealthyUnconfirmed,
        (Some(_), 0) => Verdict::MissingProcess,
        (Some(pid), 1) if observed.contains(&pid) => Verdict::Healthy,
        (Some(_), 1) => Verdict::PidMismatch,
        (Some(_), _) => Verdict::DuplicateProcesses,
    };
    Some(verdict)
}

/// What the scanner did about a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Remediation {
    Killed { pids: Vec<u32> },
    Adopted { pid: u32 },
    /// Duplicates were killed and the registered process was gone too.
    KilledAndRestartRequested { pids: Vec<u32>, enqueued: bool },
    MarkedCrashed,
    Logged,
}

/// One bot's classification and the action taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub bot_id: BotId,
    pub verdict: Verdict,
    pub status: Option<WorkerStatus>,
    pub registered_pid: Option<u32>,
    pub observed_pids: BTreeSet<u32>,
    pub remediation: Option<Remediation>,
}

/// Result of one scan cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned_at: DateTime<Utc>,
    pub processes_seen: usize,
    pub findings: Vec<Finding>,
    /// Bots left out because a lifecycle operation was in flight.
    pub settling: Vec<BotId>,
}

impl ScanReport {
    #[must_use]
    pub fn with_verdict(&self, verdict: Verdict) -> Vec<BotId> {
        self.findings
            .iter()
            .filter(|f| f.verdict == verdict)
            .map(|f| f.bot_id)
            .collect()
    }
}

/// Processes of one bot for `GET /workers/processes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotProcesses {
    pub bot_id: BotId,
    pub status: Option<WorkerStatus>,
    pub registered_pid: Option<u32>,
    pub processes: Vec<TaggedProcess>,
    pub verdict: Option<Verdict>,
    pub settling: bool,
}

struct Observation {
    bot_id: BotId,
    status: Option<WorkerStatus>,
    registered_pid: Option<u32>,
    processes: Vec<TaggedProcess>,
    settling: bool,
    verdict: Option<Verdict>,
}

impl Observation {
    fn pids(&self) -> BTreeSet<u32> {
        self.processes.iter().map(|p| p.pid).collect()
    }
}

/// The scanner. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Scanner {
    supervisor: Supervisor,
    config: ScannerConfig,
}

impl Scanner {
    #[must_use]
    pub const fn new(supervisor: Supervisor, config: ScannerConfig) -> Self {
        Self { supervisor, config }
    }

    #[must_use]
    pub const fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Scan and classify every bot seen in the registry or the process table.
    async fn observe(&self) -> Result<(usize, Vec<Observation>)> {
        let scanned = self.supervisor.processes().scan().await?;
        let seen = scanned.len();
        let mut grouped = top_level(scanned)
            .into_iter()
            .into_group_map_by(|p| p.bot_id);

        let now = Instant::now();
        let processes = self.supervisor.processes();
        let observations = self
            .supervisor
            .with_registry(|registry| {
                let bot_ids: BTreeSet<BotId> = registry
                    .bot_ids()
                    .into_iter()
                    .chain(grouped.keys().copied())
                    .collect();

                bot_ids
                    .into_iter()
                    .map(|bot_id| {
                        let record = registry.get(bot_id);
                        let status = record.map(|w| w.status);
                        let registered_pid = record
                            .filter(|w| w.status == WorkerStatus::Running)
                            .and_then(|w| w.pid);
                        let settling = registry.is_start_locked(bot_id, now)
                            || registry.is_busy(bot_id)
                            || matches!(
                                status,
                                Some(WorkerStatus::Starting | WorkerStatus::Stopping)
                            );
                        let mut procs = grouped.remove(&bot_id).unwrap_or_default();
                        procs.sort_by_key(|p| p.pid);
                        let pids: BTreeSet<u32> = procs.iter().map(|p| p.pid).collect();
                        let verdict = classify(registered_pid, &pids, |pid| processes.is_alive(pid));
                        Observation {
                            bot_id,
                            status,
                            registered_pid,
                            processes: procs,
                            settling,
                            verdict,
                        }
                    })
                    .collect()
            })
            .await;

        Ok((seen, observations))
    }

    /// Read-only view of the process table, grouped by bot.
    ///
    /// # Errors
    ///
    /// `ProcessScan` when the process table cannot be read.
    pub async fn inspect(&self) -> Result<Vec<BotProcesses>> {
        let (_, observations) = self.observe().await?;
        Ok(observations
            .into_iter()
            .filter(|o| o.verdict.is_some() || !o.processes.is_empty())
            .map(|o| BotProcesses {
                bot_id: o.bot_id,
                status: o.status,
                registered_pid: o.registered_pid,
                processes: o.processes,
                verdict: o.verdict,
                settling: o.settling,
            })
            .collect())
    }

    /// Run one scan cycle, remediating findings when `remediate` is set.
    ///
    /// # Errors
    ///
    /// `ProcessScan` when the process table cannot be read. Individual
    /// remediation failures are logged and do not fail the cycle.
    pub async fn run_cycle(&self, remediate: bool) -> Result<ScanReport> {
        let (processes_seen, observations) = self.observe().await?;
        let scanned_at = Utc::now();

        let (settling, active): (Vec<Observation>, Vec<Observation>) =
            observations.into_iter().partition(|o| o.settling);

        let mut findings = Vec::new();
        for observation in active {
            let Some(verdict) = observation.verdict else {
                continue;
            };
            let remediation = if remediate {
                Some(self.remediate(&observation, verdict).await)
            } else {
                None
            };
            findings.push(Finding {
                bot_id: observation.bot_id,
                verdict,
                status: observation.status,
                registered_pid: observation.registered_pid,
                observed_pids: observation.pids(),
                remediation,
            });
        }

        self.record_trackers(&findings, scanned_at).await;

        let report = ScanReport {
            scanned_at,
            processes_seen,
            findings,
            settling: settling.into_iter().map(|o| o.bot_id).collect(),
        };
        let problems = report
            .findings
            .iter()
            .filter(|f| f.verdict.needs_remediation())
            .count();
        if problems > 0 {
            info!(
                processes = report.processes_seen,
                findings = problems,
                settling = report.settling.len(),
                "Scan found divergence"
            );
        } else {
            debug!(processes = report.processes_seen, "Scan clean");
        }
        Ok(report)
    }

    async fn record_trackers(&self, findings: &[Finding], scanned_at: DateTime<Utc>) {
        self.supervisor
            .with_registry(|registry| {
                for finding in findings {
                    if registry.get(finding.bot_id).is_none() {
                        continue;
                    }
                    let queued = registry.policy.is_queued(finding.bot_id);
                    let tracker = registry.tracker_mut(finding.bot_id);
                    tracker.observed_pids.clone_from(&finding.observed_pids);
                    tracker.last_scan_at = Some(scanned_at);
                    tracker.last_verdict = Some(finding.verdict);
                    tracker.restart_in_progress = queued;
                }
            })
            .await;
    }

    async fn remediate(&self, observation: &Observation, verdict: Verdict) -> Remediation {
        let bot_id = observation.bot_id;
        match verdict {
            Verdict::Healthy => Remediation::Logged,
            Verdict::HealthyUnconfirmed => {
                warn!(
                    bot_id = %bot_id,
                    pid = observation.registered_pid,
                    "Registered process missing from scan but alive, leaving it"
                );
                Remediation::Logged
            }
            Verdict::OrphanProcesses => {
                let pids = self.kill(bot_id, observation.pids());
                warn!(bot_id = %bot_id, pids = ?pids, "Killed orphan processes");
                Remediation::Killed { pids }
            }
            Verdict::PidMismatch => match observation.processes.first() {
                Some(process) if self.supervisor.adopt_pid(bot_id, process.pid).await => {
                    Remediation::Adopted { pid: process.pid }
                }
                _ => Remediation::Logged,
            },
            Verdict::MissingProcess => {
                warn!(bot_id = %bot_id, pid = observation.registered_pid, "Worker process missing");
                if self.supervisor.mark_missing(bot_id).await {
                    Remediation::MarkedCrashed
                } else {
                    Remediation::Logged
                }
            }
            Verdict::DuplicateProcesses => self.resolve_duplicates(observation).await,
        }
    }

    /// Kill every pid but the registered one, wait, then re-verify.
    async fn resolve_duplicates(&self, observation: &Observation) -> Remediation {
        let bot_id = observation.bot_id;
        let registered = observation.registered_pid;
        let extras: BTreeSet<u32> = observation
            .pids()
            .into_iter()
            .filter(|pid| Some(*pid) != registered)
            .collect();

        warn!(
            bot_id = %bot_id,
            registered = ?registered,
            extras = ?extras,
            "Duplicate worker processes"
        );
        let pids = self.kill(bot_id, extras);
        tokio::time::sleep(self.config.duplicate_grace).await;

        let survivor = registered.filter(|pid| self.supervisor.processes().is_alive(*pid));
        if survivor.is_some() {
            info!(bot_id = %bot_id, pid = registered, killed = ?pids, "Duplicates resolved");
            return Remediation::Killed { pids };
        }

        warn!(bot_id = %bot_id, pid = registered, "Registered process gone after duplicate cleanup");
        let decision = self
            .supervisor
            .request_restart(bot_id, RestartReason::ProcessLost)
            .await;
        Remediation::KilledAndRestartRequested {
            pids,
            enqueued: decision.is_enqueued(),
        }
    }

    fn kill(&self, bot_id: BotId, pids: BTreeSet<u32>) -> Vec<u32> {
        pids.into_iter()
            .filter(|pid| {
                match self.supervisor.processes().signal(*pid, WorkerSignal::Kill) {
                    Ok(sent) => sent,
                    Err(e) => {
                        warn!(bot_id = %bot_id, pid, error = %e, "Kill failed");
                        false
                    }
                }
            })
            .collect()
    }
}

/// Group a raw scan for display.
#[must_use]
pub fn group_by_bot(processes: Vec<TaggedProcess>) -> BTreeMap<BotId, Vec<TaggedProcess>> {
    processes
        .into_iter()
        .sorted_by_key(|p| (p.bot_id, p.pid))
        .chunk_by(|p| p.bot_id)
        .into_iter()
        .map(|(bot_id, group)| (bot_id, group.collect()))
        .collect()
}
