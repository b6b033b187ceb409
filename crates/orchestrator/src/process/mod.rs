//! OS process abstraction.
//!
//! The supervisor and scanner never touch the OS directly. Everything goes
//! through [`ProcessManager`], which returns typed pids and exit information.
//! [`NativeProcessManager`] is the production implementation; tests use the
//! in-memory fake from `crate::testing`.

mod native;
pub mod procfs;

use std::fmt;

use async_trait::async_trait;
use fleet_core::{BotId, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};

pub use native::NativeProcessManager;

/// Everything needed to start one worker process.
#[derive(Clone)]
pub struct SpawnRequest {
    pub bot_id: BotId,
    pub command: String,
    pub args: Vec<String>,
    /// Environment added to the child, including the bot tag.
    pub env: Vec<(String, String)>,
}

impl fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("SpawnRequest")
            .field("bot_id", &self.bot_id)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env_keys", &keys)
            .finish()
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    #[must_use]
    pub const fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    #[must_use]
    pub const fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

/// A started worker: its pid, its pipes, and a future resolving on exit.
pub struct SpawnedWorker {
    pub pid: u32,
    /// Controller → worker frames.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker → controller frames.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub exit: BoxFuture<'static, ExitInfo>,
}

impl fmt::Debug for SpawnedWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnedWorker")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Signals the supervisor escalates through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

impl WorkerSignal {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

/// A process found in the process table carrying a bot tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaggedProcess {
    pub pid: u32,
    pub ppid: u32,
    pub bot_id: BotId,
    pub rss_bytes: Option<u64>,
}

/// Platform seam for spawning, signalling, and enumerating worker processes.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Start a worker process with piped stdin/stdout.
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker>;

    /// Send a signal. `Ok(false)` when the process no longer exists.
    fn signal(&self, pid: u32, signal: WorkerSignal) -> Result<bool>;

    /// Independent liveness probe that does not rely on the tag scan.
    fn is_alive(&self, pid: u32) -> bool;

    /// Enumerate every live process carrying a bot tag, children included.
    async fn scan(&self) -> Result<Vec<TaggedProcess>>;

    /// Resident set size of a process, if it can be read.
    async fn rss_bytes(&self, pid: u32) -> Option<u64>;
}

/// Keep only top-level tagged processes.
///
/// A tagged process whose parent is tagged for the same bot inherited the
/// tag from its worker and is not a second worker.
#[must_use]
pub fn top_level(processes: Vec<TaggedProcess>) -> Vec<TaggedProcess> {
    let tagged: std::collections::HashMap<u32, BotId> =
        processes.iter().map(|p| (p.pid, p.bot_id)).collect();
    processes
        .into_iter()
        .filter(|p| tagged.get(&p.ppid) != Some(&p.bot_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(pid: u32, ppid: u32, bot: u64) -> TaggedProcess {
        TaggedProcess {
            pid,
            ppid,
            bot_id: BotId::new(bot),
            rss_bytes: None,
        }
    }

    #[test]
    fn test_top_level_drops_inherited_children() {
        let processes = vec![tagged(100, 1, 7), tagged(101, 100, 7), tagged(200, 100, 8)];
        let top: Vec<u32> = top_level(processes).iter().map(|p| p.pid).collect();
        assert_eq!(top, vec![100, 200]);
    }

    #[test]
    fn test_exit_info_display() {
        assert_eq!(ExitInfo::code(1).to_string(), "exit code 1");
        assert_eq!(ExitInfo::signaled(9).to_string(), "signal 9");
        assert!(ExitInfo::code(0).is_success());
        assert!(!ExitInfo::signaled(15).is_success());
    }
}
