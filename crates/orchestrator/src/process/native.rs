//! Native process manager: tokio child processes, POSIX signals, procfs scan.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use fleet_core::{Error, Result};
use futures::FutureExt;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ExitInfo, ProcessManager, SpawnRequest, SpawnedWorker, TaggedProcess, WorkerSignal, procfs};

/// Pids that must never be signalled.
const PROTECTED_PIDS: [u32; 2] = [0, 1];

/// Spawns workers as child processes and inspects them through procfs.
#[derive(Debug, Clone)]
pub struct NativeProcessManager {
    proc_root: PathBuf,
    tag_env: String,
}

impl NativeProcessManager {
    pub fn new(proc_root: impl Into<PathBuf>, tag_env: impl Into<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            tag_env: tag_env.into(),
        }
    }

    fn nix_pid(pid: u32) -> Result<Pid> {
        if PROTECTED_PIDS.contains(&pid) {
            return Err(Error::signal(pid, "refusing to signal a protected pid"));
        }
        i32::try_from(pid)
            .map(Pid::from_raw)
            .map_err(|_| Error::signal(pid, "pid out of range"))
    }
}

#[cfg(unix)]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[async_trait]
impl ProcessManager for NativeProcessManager {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker> {
        let mut child = Command::new(&request.command)
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| Error::spawn(request.bot_id, format!("{}: {e}", request.command)))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::spawn(request.bot_id, "child exited before reporting a pid"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::spawn(request.bot_id, "stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::spawn(request.bot_id, "stdout was not piped"))?;

        let bot_id = request.bot_id;
        let exit = async move {
            match child.wait().await {
                Ok(status) => exit_info(status),
                Err(e) => {
                    warn!(bot_id = %bot_id, pid, error = %e, "Failed to wait on worker");
                    ExitInfo::default()
                }
            }
        }
        .boxed();

        info!(bot_id = %bot_id, pid, command = %request.command, "Spawned worker process");

        Ok(SpawnedWorker {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit,
        })
    }

    fn signal(&self, pid: u32, signal: WorkerSignal) -> Result<bool> {
        let sig = match signal {
            WorkerSignal::Terminate => Signal::SIGTERM,
            WorkerSignal::Kill => Signal::SIGKILL,
        };

        match signal::kill(Self::nix_pid(pid)?, sig) {
            Ok(()) => {
                debug!(pid, signal = signal.as_str(), "Signal sent");
                Ok(true)
            }
            Err(Errno::ESRCH) => {
                debug!(pid, signal = signal.as_str(), "Process already gone (ESRCH)");
                Ok(false)
            }
            Err(e) => Err(Error::signal(pid, format!("{}: {e}", signal.as_str()))),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(nix_pid) = Self::nix_pid(pid) else {
            return false;
        };
        // Signal 0 probes existence; EPERM still means the pid exists.
        let exists = match signal::kill(nix_pid, None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        };
        exists && !procfs::is_zombie(&self.proc_root, pid)
    }

    async fn scan(&self) -> Result<Vec<TaggedProcess>> {
        let root = self.proc_root.clone();
        let tag_env = self.tag_env.clone();
        tokio::task::spawn_blocking(move || procfs::read_tagged(&root, &tag_env))
            .await
            .map_err(|e| Error::process_scan(format!("scan task failed: {e}")))?
    }

    async fn rss_bytes(&self, pid: u32) -> Option<u64> {
        let root = self.proc_root.clone();
        tokio::task::spawn_blocking(move || procfs::read_rss(&root, pid))
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protected_pids_are_refused() {
        let manager = NativeProcessManager::new("/proc", "FLEET_BOT_ID");
        assert!(manager.signal(1, WorkerSignal::Kill).is_err());
        assert!(manager.signal(0, WorkerSignal::Terminate).is_err());
        assert!(!manager.is_alive(0));
    }

    #[test]
    fn test_out_of_range_pid_is_refused() {
        let manager = NativeProcessManager::new("/proc", "FLEET_BOT_ID");
        assert!(manager.signal(u32::MAX, WorkerSignal::Terminate).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_process_is_alive() {
        let manager = NativeProcessManager::new("/proc", "FLEET_BOT_ID");
        assert!(manager.is_alive(std::process::id()));
    }
}
