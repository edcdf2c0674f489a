//! Single-instance run lock.
//!
//! The lock is a JSON [`LockRecord`]. It is written in full to a private temp
//! file and published with `hard_link`, which fails if the lock already
//! exists; the lock path therefore never holds a partial record. When the
//! file already exists, its owner pid is probed; a dead owner's lock is
//! removed and publishing is retried once. A lock that cannot be parsed is
//! only treated as stale once it is older than [`UNREADABLE_GRACE`].
//!
//! Owner liveness is an OS process-table lookup: `/proc/<pid>` on Linux,
//! `kill -0 <pid>` through the `kill` utility on other Unix systems (where
//! "permission denied" still means alive). Anywhere else the owner is assumed
//! alive, so a lock is never stolen on a platform that cannot check.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Age after which an unparseable lock file no longer blocks a run.
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(60);

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub host: String,
    pub head_sha: String,
    pub run_id: String,
}

impl LockRecord {
    /// Record for the current process.
    pub fn for_current_process(run_id: &str, head_sha: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            pid: std::process::id(),
            started_at,
            host: hostname(),
            head_sha: head_sha.to_string(),
            run_id: run_id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run is active (pid {}, run {})", .owner.pid, .owner.run_id)]
    AlreadyRunning { owner: LockRecord },

    #[error("lock file {path} is unreadable and was modified {age_secs}s ago")]
    Unreadable { path: String, age_secs: u64 },

    #[error("lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Result of a successful acquire.
#[derive(Debug)]
pub struct Acquired {
    pub guard: LockGuard,
    /// Present when a dead owner's lock was removed. `None` inside means the
    /// removed file could not be parsed.
    pub replaced_stale: Option<Option<LockRecord>>,
}

/// Creates and inspects the lock file at one path.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Current lock owner. `Ok(None)` when there is no lock file; an
    /// unparseable file reads as `Ok(Some(None))`.
    pub fn read_owner(&self) -> Result<Option<Option<LockRecord>>, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content).ok())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    pub fn acquire(&self, record: &LockRecord) -> Result<Acquired, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let mut replaced_stale = None;
        for _ in 0..2 {
            match self.create_exclusive(record) {
                Ok(()) => {
                    return Ok(Acquired {
                        guard: LockGuard {
                            path: self.path.clone(),
                            pid: record.pid,
                            released: AtomicBool::new(false),
                        },
                        replaced_stale,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(self.io_err(e)),
            }

            match self.read_owner()? {
                // Removed between our create and read; try again.
                None => continue,
                Some(Some(owner)) if pid_alive(owner.pid) => {
                    return Err(LockError::AlreadyRunning { owner })
                }
                Some(None) => {
                    if let Some(age) = self.age().filter(|age| *age < UNREADABLE_GRACE) {
                        return Err(LockError::Unreadable {
                            path: self.path.display().to_string(),
                            age_secs: age.as_secs(),
                        });
                    }
                    self.remove_stale(None)?;
                    replaced_stale = Some(None);
                }
                Some(Some(owner)) => {
                    self.remove_stale(Some(owner.pid))?;
                    replaced_stale = Some(Some(owner));
                }
            }
        }

        // Lost a race against another starter both times.
        match self.read_owner()? {
            Some(Some(owner)) => Err(LockError::AlreadyRunning { owner }),
            _ => Err(self.io_err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "lock contended",
            ))),
        }
    }

    /// Time since the lock file was last modified; `None` if unknown.
    fn age(&self) -> Option<Duration> {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    fn remove_stale(&self, pid: Option<u32>) -> Result<(), LockError> {
        tracing::warn!(path = %self.path.display(), ?pid, "removing stale lock");
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn temp_path(&self, record: &LockRecord) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".into());
        self.path
            .with_file_name(format!(".{name}.{}-{}.tmp", record.pid, record.run_id))
    }

    /// Write the record to a temp file, then link it into place. The link
    /// fails with `AlreadyExists` when another lock is present.
    fn create_exclusive(&self, record: &LockRecord) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.temp_path(record);
        let published = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .and_then(|mut file| {
                file.write_all(&json)?;
                file.sync_all()
            })
            .and_then(|()| fs::hard_link(&tmp, &self.path));
        let _ = fs::remove_file(&tmp);
        published
    }
}

/// Held lock. Released explicitly by the finalizer, or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
    released: AtomicBool,
}

impl LockGuard {
    /// Remove the lock file. Safe to call repeatedly; a file that now names
    /// another owner is left alone.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockRecord>(&c).ok())
            .map_or(true, |r| r.pid == self.pid);
        if !ours {
            tracing::warn!(path = %self.path.display(), "lock file changed owner; leaving it");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "lock released"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(path = %self.path.display(), error = %e, "failed to release lock"),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Whether a process with `pid` exists.
#[cfg(target_os = "linux")]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}

/// Whether a process with `pid` exists.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
    {
        Ok(out) if out.status.success() => true,
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr).to_ascii_lowercase();
            stderr.contains("not permitted") || stderr.contains("permission")
        }
        Err(_) => true,
    }
}

/// Whether a process with `pid` exists.
#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| {
            fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .or_else(|| fs::read_to_string("/etc/hostname").ok().map(|h| h.trim().to_string()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".into())
}
