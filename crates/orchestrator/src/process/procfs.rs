//! Process table enumeration through a procfs-style directory.
//!
//! Workers are identified by an environment variable set at spawn time, read
//! back from `<root>/<pid>/environ`. Parent pid, state and resident memory
//! come from `<root>/<pid>/status`. The root is configurable so the scan can
//! be pointed at a fixture directory.

use std::fs;
use std::path::Path;

use fleet_core::{BotId, Error, Result};
use tracing::debug;

use super::TaggedProcess;

/// Fields of `/proc/<pid>/status` the scanner needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcStatus {
    pub ppid: u32,
    /// Single-letter state (`R`, `S`, `Z`, ...).
    pub state: char,
    pub rss_bytes: Option<u64>,
}

impl ProcStatus {
    #[must_use]
    pub const fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Parse the text of a status file.
#[must_use]
pub fn parse_status(content: &str) -> ProcStatus {
    let mut status = ProcStatus {
        state: '?',
        ..ProcStatus::default()
    };

    for line in content.lines() {
        if let Some(val) = line.strip_prefix("PPid:") {
            status.ppid = val.trim().parse().unwrap_or(0);
        } else if let Some(val) = line.strip_prefix("State:") {
            status.state = val.trim().chars().next().unwrap_or('?');
        } else if let Some(val) = line.strip_prefix("VmRSS:") {
            // "VmRSS:\t  123456 kB"
            status.rss_bytes = val
                .split_whitespace()
                .next()
                .and_then(|kb| kb.parse::<u64>().ok())
                .map(|kb| kb.saturating_mul(1024));
        }
    }

    status
}

/// Find the bot tag in a NUL-separated environment block.
#[must_use]
pub fn parse_environ_tag(environ: &[u8], tag_env: &str) -> Option<BotId> {
    environ
        .split(|b| *b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(key, _)| *key == tag_env)
                .and_then(|(_, value)| value.parse::<BotId>().ok())
        })
}

fn read_status(root: &Path, pid: u32) -> Option<ProcStatus> {
    fs::read_to_string(root.join(pid.to_string()).join("status"))
        .ok()
        .map(|s| parse_status(&s))
}

/// Enumerate live tagged processes under `root`.
///
/// Processes that vanish mid-scan, or whose environment is unreadable
/// (other users' processes), are skipped. Zombies are not live.
///
/// # Errors
///
/// Returns `ProcessScan` when the root itself cannot be read.
pub fn read_tagged(root: &Path, tag_env: &str) -> Result<Vec<TaggedProcess>> {
    let entries = fs::read_dir(root)
        .map_err(|e| Error::process_scan(format!("cannot read {}: {e}", root.display())))?;

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let Ok(environ) = fs::read(entry.path().join("environ")) else {
            continue;
        };
        let Some(bot_id) = parse_environ_tag(&environ, tag_env) else {
            continue;
        };
        let Some(status) = read_status(root, pid) else {
            continue;
        };
        if status.is_zombie() {
            continue;
        }

        found.push(TaggedProcess {
            pid,
            ppid: status.ppid,
            bot_id,
            rss_bytes: status.rss_bytes,
        });
    }

    found.sort_by_key(|p| p.pid);
    debug!(tagged = found.len(), root = %root.display(), "Scanned process table");
    Ok(found)
}

/// Resident set size of `pid`.
#[must_use]
pub fn read_rss(root: &Path, pid: u32) -> Option<u64> {
    read_status(root, pid).and_then(|s| s.rss_bytes)
}

/// A pid whose status file shows a zombie. Missing entries are not zombies.
#[must_use]
pub fn is_zombie(root: &Path, pid: u32) -> bool {
    read_status(root, pid).is_some_and(|s| s.is_zombie())
}
