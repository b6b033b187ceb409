//! Jittered tickers for the periodic control tasks.
//!
//! Each [`Schedule`] gets its own task that sleeps `interval + rand(0..jitter)`
//! and then delivers a tick to a [`TickSink`]. Ticks are plain notifications:
//! the sink decides whether a run is already in progress. Sleeping goes
//! through `tokio::time`, so a paused test runtime drives the schedule.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::FleetConfig;

/// The periodic tasks of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Sync,
    Scan,
    Health,
    Memory,
    RestartQueue,
}

impl TaskKind {
    pub const ALL: [Self; 5] = [
        Self::Sync,
        Self::Scan,
        Self::Health,
        Self::Memory,
        Self::RestartQueue,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Scan => "scan",
            Self::Health => "health",
            Self::Memory => "memory",
            Self::RestartQueue => "restart_queue",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub kind: TaskKind,
    pub interval: Duration,
    pub jitter: Duration,
}

impl Schedule {
    #[must_use]
    pub const fn new(kind: TaskKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            jitter: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// The next sleep: the interval plus up to `jitter`.
    #[must_use]
    pub fn next_delay(&self, rng: &mut impl Rng) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        self.interval + Duration::from_millis(rng.gen_range(0..=jitter_ms))
    }

    /// One schedule per task, from the configuration.
    #[must_use]
    pub fn from_config(config: &FleetConfig) -> Vec<Self> {
        vec![
            Self::new(TaskKind::Sync, config.sync.interval).with_jitter(config.sync.jitter),
            Self::new(TaskKind::Scan, config.scanner.interval),
            Self::new(TaskKind::Health, config.health.check_interval),
            Self::new(TaskKind::Memory, config.health.memory_check_interval),
            Self::new(TaskKind::RestartQueue, config.restart.queue_interval),
        ]
    }
}

/// Receiver of ticks. Returns `false` once it no longer accepts them.
pub trait TickSink: Send + Sync + 'static {
    fn tick(&self, kind: TaskKind) -> bool;
}

impl TickSink for tokio::sync::mpsc::UnboundedSender<TaskKind> {
    fn tick(&self, kind: TaskKind) -> bool {
        self.send(kind).is_ok()
    }
}

/// Running tickers. Dropping the handle does not stop them; call [`stop`].
///
/// [`stop`]: SchedulerHandle::stop
#[derive(Debug)]
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every ticker to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop and wait for every ticker to exit.
    pub async fn shutdown(self) {
        self.stop();
        for task in self.tasks {
            let _ = task.await;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

pub struct Scheduler;

impl Scheduler {
    /// Spawn one ticker per schedule.
    pub fn start<S>(schedules: &[Schedule], sink: S) -> SchedulerHandle
    where
        S: TickSink + Clone,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let tasks = schedules
            .iter()
            .copied()
            .map(|schedule| tokio::spawn(run_ticker(schedule, sink.clone(), stop_rx.clone())))
            .collect();
        SchedulerHandle { stop_tx, tasks }
    }
}

async fn run_ticker<S: TickSink>(schedule: Schedule, sink: S, mut stop_rx: watch::Receiver<bool>) {
    loop {
        let delay = schedule.next_delay(&mut rand::thread_rng());
        tokio::select! {
            () = tokio::time::sleep(delay) => {
                if !sink.tick(schedule.kind) {
                    debug!(task = %schedule.kind, "Tick sink closed, ticker exiting");
                    break;
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}
