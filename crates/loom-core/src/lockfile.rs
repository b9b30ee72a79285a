//! Daemon lockfile — single-instance guard.
//!
//! The daemon writes a JSON lockfile to `~/.loom/daemon.lock` at startup.
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lockfile.
//! If two daemons race, exactly one wins the create — the loser gets
//! `AlreadyExists` and can check whether the winner is still alive.
//!
//! ## Stale lockfile recovery
//!
//! The PID in the lockfile is probed via `kill(pid, 0)`. If the process is
//! dead (crash, SIGKILL), the stale lockfile is removed automatically and
//! the next daemon can start.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Runtime state written by the daemon at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub started_at: String,
    pub workspace_dir: String,
    pub version: String,
}

/// Result of trying to acquire the lockfile.
pub enum AcquireResult {
    /// We created the lockfile — we own it.
    Acquired,
    /// Another live daemon holds the lockfile.
    AlreadyRunning(DaemonLockfile),
    /// Stale lockfile was cleaned up — retry.
    StaleRemoved,
}

impl DaemonLockfile {
    pub fn new(workspace_dir: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            workspace_dir: workspace_dir.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Canonical lockfile path: `~/.loom/daemon.lock`.
    pub fn default_path() -> PathBuf {
        crate::config::Config::home_dir().join("daemon.lock")
    }

    /// Try to exclusively create and write the lockfile at `path`.
    pub fn acquire_at(&self, path: &Path) -> std::io::Result<AcquireResult> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL — fails if file exists
            .open(path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::read_at(path) {
                    Some(existing) if existing.is_alive() => {
                        Ok(AcquireResult::AlreadyRunning(existing))
                    }
                    _ => {
                        tracing::info!("removing stale daemon lockfile");
                        Self::remove_at(path);
                        Ok(AcquireResult::StaleRemoved)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Acquire with one automatic retry after stale cleanup.
    pub fn acquire_or_fail(&self, path: &Path) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire_at(path) {
                Ok(AcquireResult::Acquired) => return Ok(()),
                Ok(AcquireResult::AlreadyRunning(existing)) => {
                    return Err(format!(
                        "daemon already running (pid={}, started={})",
                        existing.pid, existing.started_at
                    ));
                }
                Ok(AcquireResult::StaleRemoved) if attempt == 0 => {
                    tracing::info!("stale lockfile removed, retrying acquire");
                    continue;
                }
                Ok(AcquireResult::StaleRemoved) => {
                    return Err("failed to acquire lockfile after stale cleanup".into());
                }
                Err(e) => return Err(format!("lockfile I/O error: {e}")),
            }
        }
        Err("lockfile acquire failed".into())
    }

    /// Read the lockfile. Returns `None` if missing or unparseable.
    pub fn read_at(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn remove_at(path: &Path) {
        let _ = std::fs::remove_file(path);
    }

    /// Check if the PID in this lockfile is still alive.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}
