//! Single-instance lockfile at `~/.port-daddy/daemon.lock`.
//!
//! `acquire()` uses `O_CREAT | O_EXCL`, so two daemons racing have exactly
//! one winner; the loser learns the incumbent's address. Stale lockfiles
//! (dead pid) are removed automatically.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonLockfile {
    pub pid: u32,
    pub tcp_port: Option<u16>,
    pub socket_path: String,
    pub host: String,
    pub started_at: i64,
    pub version: String,
}

pub enum AcquireResult {
    /// We created the lockfile.
    Acquired,
    /// Another live daemon holds it.
    AlreadyRunning(DaemonLockfile),
    /// Stale lockfile was cleaned up; retry.
    StaleRemoved,
}

impl DaemonLockfile {
    pub fn path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".port-daddy").join("daemon.lock")
    }

    /// Exclusively create and write the lockfile.
    pub fn acquire(&self) -> std::io::Result<AcquireResult> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read() {
                Some(existing) if existing.is_alive() => {
                    Ok(AcquireResult::AlreadyRunning(existing))
                }
                _ => {
                    tracing::info!("removing stale daemon lockfile");
                    Self::remove();
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with one retry after stale cleanup.
    pub fn acquire_or_fail(&self) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire() {
                Ok(AcquireResult::Acquired) => return Ok(()),
                Ok(AcquireResult::AlreadyRunning(existing)) => {
                    return Err(format!(
                        "daemon already running (pid={}, socket={})",
                        existing.pid, existing.socket_path
                    ));
                }
                Ok(AcquireResult::StaleRemoved) if attempt == 0 => continue,
                Ok(AcquireResult::StaleRemoved) => {
                    return Err("failed to acquire lockfile after stale cleanup".into());
                }
                Err(e) => return Err(format!("lockfile I/O error: {e}")),
            }
        }
        Err("lockfile acquire failed".into())
    }

    pub fn read() -> Option<Self> {
        let content = std::fs::read_to_string(Self::path()).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove() {
        let _ = std::fs::remove_file(Self::path());
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// The lockfile of a live daemon, removing stale entries as a side
    /// effect.
    pub fn read_valid() -> Option<Self> {
        let lock = Self::read()?;
        if lock.is_alive() {
            Some(lock)
        } else {
            tracing::info!(pid = lock.pid, "removing stale daemon lockfile");
            Self::remove();
            None
        }
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 checks existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
