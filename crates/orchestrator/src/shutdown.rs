//! Graceful shutdown of the controller.
//!
//! SIGTERM/SIGINT are turned into a broadcast. Whoever owns the [`Fleet`]
//! then runs [`ShutdownCoordinator::wait_with_timeout`], which stops the
//! control loop first and every worker second, all within 30 seconds.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fleet_core::{Error, Result};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::fleet::Fleet;
use crate::supervisor::{Escalation, StopReport};

/// Upper bound on the whole shutdown sequence.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownSignal {
    Sigterm,
    Sigint,
    /// Requested from code, or the signal channel went away.
    Programmatic,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sigterm => "SIGTERM",
            Self::Sigint => "SIGINT",
            Self::Programmatic => "programmatic",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownPhase {
    Running,
    Initiating,
    StoppingControlLoop,
    StoppingWorkers,
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownStats {
    pub workers_stopped: usize,
    /// Workers that needed SIGTERM or SIGKILL.
    pub workers_escalated: usize,
    pub workers_unresponsive: usize,
    pub total_duration_ms: u64,
}

impl ShutdownStats {
    fn from_reports(reports: &[StopReport], elapsed: Duration) -> Self {
        let count = |pred: fn(Escalation) -> bool| {
            reports.iter().filter(|r| pred(r.escalation)).count()
        };
        Self {
            workers_stopped: reports.len(),
            workers_escalated: count(|e| matches!(e, Escalation::Terminated | Escalation::Killed)),
            workers_unresponsive: count(|e| e == Escalation::Unresponsive),
            total_duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Fans a single shutdown request out to every subscriber and tracks how
/// far the teardown has got.
pub struct ShutdownCoordinator {
    requested: AtomicBool,
    signals: broadcast::Sender<ShutdownSignal>,
    phase: watch::Sender<ShutdownPhase>,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            signals: broadcast::channel(4).0,
            phase: watch::Sender::new(ShutdownPhase::Running),
        }
    }

    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Follow phase changes.
    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signals.subscribe()
    }

    /// Broadcast the shutdown. Only the first call has any effect.
    pub fn initiate_shutdown(&self, signal: ShutdownSignal) {
        if self.requested.swap(true, Ordering::AcqRel) {
            debug!(signal = %signal, "Shutdown already requested");
            return;
        }

        info!(signal = %signal, "Shutting down");
        self.phase.send_replace(ShutdownPhase::Initiating);
        if self.signals.send(signal).is_err() {
            debug!("Nobody is waiting on the shutdown broadcast");
        }
    }

    /// Stop the control loop, then every worker.
    pub async fn shutdown(&self, fleet: &Fleet) -> ShutdownStats {
        let start = Instant::now();

        self.phase.send_replace(ShutdownPhase::StoppingControlLoop);
        fleet.stop_control_loop().await;

        self.phase.send_replace(ShutdownPhase::StoppingWorkers);
        let reports = fleet.supervisor().stop_all().await;

        let stats = ShutdownStats::from_reports(&reports, start.elapsed());
        self.phase.send_replace(ShutdownPhase::Complete);
        info!(
            workers = stats.workers_stopped,
            escalated = stats.workers_escalated,
            unresponsive = stats.workers_unresponsive,
            duration_ms = stats.total_duration_ms,
            "All workers stopped"
        );
        stats
    }

    /// [`shutdown`](Self::shutdown) bounded by [`SHUTDOWN_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// `Io` with kind `TimedOut` when the deadline passes.
    pub async fn wait_with_timeout(&self, fleet: &Fleet) -> Result<ShutdownStats> {
        self.shutdown_within(fleet, SHUTDOWN_TIMEOUT).await
    }

    /// # Errors
    ///
    /// `Io` with kind `TimedOut` when `limit` passes.
    pub async fn shutdown_within(&self, fleet: &Fleet, limit: Duration) -> Result<ShutdownStats> {
        timeout(limit, self.shutdown(fleet)).await.map_err(|_| {
            error!(limit_secs = limit.as_secs(), phase = ?self.phase(), "Shutdown deadline exceeded");
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("shutdown exceeded {}s", limit.as_secs()),
            ))
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a task that turns the first SIGTERM or SIGINT into a shutdown.
pub fn install_signal_handlers(coordinator: Arc<ShutdownCoordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match next_os_signal().await {
            Ok(signal) => coordinator.initiate_shutdown(signal),
            Err(e) => error!(error = %e, "Cannot listen for OS signals"),
        }
    })
}

#[cfg(unix)]
async fn next_os_signal() -> std::io::Result<ShutdownSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    debug!("Listening for SIGTERM and SIGINT");
    Ok(tokio::select! {
        _ = term.recv() => ShutdownSignal::Sigterm,
        _ = int.recv() => ShutdownSignal::Sigint,
    })
}

#[cfg(not(unix))]
async fn next_os_signal() -> std::io::Result<ShutdownSignal> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Sigint)
}

/// Resolve once a shutdown has been broadcast.
pub async fn wait_for_signal(mut receiver: broadcast::Receiver<ShutdownSignal>) -> ShutdownSignal {
    loop {
        match receiver.recv().await {
            Ok(signal) => return signal,
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                warn!("Shutdown channel closed");
                return ShutdownSignal::Programmatic;
            }
        }
    }
}
