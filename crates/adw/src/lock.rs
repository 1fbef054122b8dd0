//! Advisory file lock guarding the port allocation table.
//!
//! Mirrors the lock-file-with-staleness shape used elsewhere in the pack
//! for single-writer resources, but scoped to the brief load-mutate-save
//! window of one allocator call rather than held for an entire run: the
//! lock is acquired, the table is read and rewritten, and it is released
//! before the caller does anything else. A lock file left behind by a
//! process that crashed mid-allocation is stolen once it is older than
//! [`STALE_AFTER`].

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AllocatorError;

const LOCK_FILE: &str = "port_allocations.lock";
const STALE_AFTER: Duration = Duration::from_secs(30);
const SPIN_TIMEOUT: Duration = Duration::from_secs(5);
const SPIN_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held for the duration of one allocator critical section. Released (the
/// lock file removed) on drop, so a panic mid-section still frees it.
pub struct PortAllocationLock {
    path: PathBuf,
}

impl PortAllocationLock {
    pub fn acquire(agents_dir: &Path) -> Result<Self, AllocatorError> {
        fs::create_dir_all(agents_dir)?;
        let path = agents_dir.join(LOCK_FILE);
        let start = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut f) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let json = serde_json::to_vec(&info)
                        .map_err(|e| AllocatorError::Io(std::io::Error::other(e.to_string())))?;
                    f.write_all(&json)?;
                    f.sync_all().ok();
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::steal_if_stale(&path) {
                        continue;
                    }
                    if start.elapsed() > SPIN_TIMEOUT {
                        return Err(AllocatorError::Locked(format!(
                            "port allocation lock at {} held past {SPIN_TIMEOUT:?}",
                            path.display(),
                        )));
                    }
                    std::thread::sleep(SPIN_DELAY);
                }
                Err(e) => return Err(AllocatorError::Io(e)),
            }
        }
    }

    /// Returns `true` if the lock at `path` was stolen (or had already
    /// vanished) and the caller should retry acquiring it immediately.
    fn steal_if_stale(path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(path) else {
            // Released or never fully written by its holder; retry fresh.
            return true;
        };
        let Ok(info) = serde_json::from_str::<LockInfo>(&content) else {
            let _ = fs::remove_file(path);
            return true;
        };
        let age = Utc::now() - info.acquired_at;
        if age.num_seconds().unsigned_abs() > STALE_AFTER.as_secs() {
            let _ = fs::remove_file(path);
            return true;
        }
        false
    }
}

impl Drop for PortAllocationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
