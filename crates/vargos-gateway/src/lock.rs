// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide lock file — ensures only one [`crate::hub::GatewayHub`] runs
//! per data directory.
//!
//! `<data>/gateway.lock` holds `{host, pid, startedAt, heartbeat}`. A
//! background task refreshes `heartbeat` every [`HEARTBEAT_INTERVAL`]; a
//! contending process considers the lock stale once `heartbeat` is older
//! than [`STALE_THRESHOLD`] — except on the *same* host, where it can do a
//! cheaper liveness check against the recorded pid instead of waiting out
//! the staleness window.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const STALE_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub host: String,
    pub pid: u32,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another instance is running on {host} (pid {pid})")]
    Contended { host: String, pid: u32 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed lock file: {0}")]
    Serde(#[from] serde_json::Error),
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".into())
}

/// Returns `true` if a process with `pid` is alive on this host.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 performs no-op permission/existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

fn read_lock(path: &Path) -> Option<LockRecord> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn write_lock(path: &Path, record: &LockRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("lock.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// An acquired, held lock. The heartbeat is refreshed in a background task
/// for as long as this value lives; dropping it stops the refresh (but does
/// not delete the file — a future process will see a stale heartbeat and
/// reclaim it, matching the cross-host-safe staleness check).
pub struct GatewayLock {
    path: PathBuf,
    _heartbeat_task: tokio::task::JoinHandle<()>,
}

impl GatewayLock {
    /// Acquire the lock at `<data_dir>/gateway.lock`, failing with
    /// [`LockError::Contended`] if a live holder already owns it.
    pub async fn acquire(data_dir: &Path) -> Result<Self, LockError> {
        let path = data_dir.join("gateway.lock");
        let host = hostname();
        let pid = std::process::id();

        if let Some(existing) = read_lock(&path) {
            let age = Utc::now().signed_duration_since(existing.heartbeat);
            let stale = if existing.host == host {
                !pid_alive(existing.pid)
            } else {
                age.to_std().map(|d| d > STALE_THRESHOLD).unwrap_or(true)
            };
            if !stale {
                return Err(LockError::Contended { host: existing.host, pid: existing.pid });
            }
            warn!(
                stale_host = existing.host,
                stale_pid = existing.pid,
                "reclaiming stale gateway lock"
            );
        }

        let now = Utc::now();
        let record = LockRecord { host, pid, started_at: now, heartbeat: now };
        write_lock(&path, &record)?;

        let heartbeat_path = path.clone();
        let heartbeat_record = record.clone();
        let task = tokio::spawn(async move {
            let mut record = heartbeat_record;
            loop {
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                record.heartbeat = Utc::now();
                if let Err(e) = write_lock(&heartbeat_path, &record) {
                    warn!(error = %e, "failed to refresh gateway lock heartbeat");
                }
            }
        });

        Ok(Self { path, _heartbeat_task: task })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GatewayLock {
    fn drop(&mut self) {
        self._heartbeat_task.abort();
    }
}

mod hostname {
    //! Minimal `gethostname` wrapper — avoids pulling in a dedicated crate
    //! for one syscall when `libc` already provides the primitive.
    use std::ffi::OsString;

    pub fn get() -> std::io::Result<OsString> {
        #[cfg(unix)]
        {
            let mut buf = vec![0u8; 256];
            let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            buf.truncate(len);
            Ok(OsString::from(String::from_utf8_lossy(&buf).into_owned()))
        }
        #[cfg(not(unix))]
        {
            Ok(OsString::from("unknown-host".to_string()))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
