// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Budget for acquiring the lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out acquiring lockfile {0}")]
    Timeout(PathBuf),

    #[error("lockfile io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Holds the config lockfile; released on drop.
///
/// The file contains the owner's JSON-encoded PID. A lockfile whose PID no
/// longer maps to a live process is stale and reclaimed.
pub struct LockGuard {
    path: PathBuf,
    pid: u32,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match std::fs::read(&self.path) {
            Ok(bytes) => {
                if serde_json::from_slice::<u32>(&bytes).ok() == Some(self.pid) {
                    if let Err(e) = std::fs::remove_file(&self.path) {
                        warn!(path = %self.path.display(), error = %e, "failed to remove lockfile");
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to read lockfile on unlock"),
        }
    }
}

/// Acquire `path`, polling every 100 ms within a 5 s budget.
pub async fn acquire(path: &Path) -> Result<LockGuard, LockError> {
    let pid = std::process::id();
    let start = Instant::now();

    loop {
        match try_acquire(path, pid).await? {
            true => {
                debug!(path = %path.display(), pid, "acquired lockfile");
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    pid,
                });
            }
            false => {
                if start.elapsed() > LOCK_TIMEOUT {
                    return Err(LockError::Timeout(path.to_path_buf()));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

async fn try_acquire(path: &Path, pid: u32) -> Result<bool, LockError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            // A zero-length file is a holder that has created the lock but
            // not yet landed its PID; that is a live writer, not garbage.
            // Leave it alone and poll again.
            if bytes.is_empty() {
                return Ok(false);
            }
            // Same-process holders release promptly; only dead owners and
            // corrupt contents are reclaimed.
            let stale = match serde_json::from_slice::<u32>(&bytes) {
                Ok(owner) => owner != pid && !pid_is_alive(owner),
                Err(_) => true,
            };
            if stale {
                debug!(path = %path.display(), "reclaiming stale lockfile");
                let _ = tokio::fs::remove_file(path).await;
            }
            Ok(false)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let contents = serde_json::to_vec(&pid).expect("pid serializes");
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                // The PID goes through the same handle so no second open is
                // needed between creation and a readable owner.
                Ok(mut file) => match write_owner(&mut file, &contents).await {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        let _ = tokio::fs::remove_file(path).await;
                        Err(e.into())
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn write_owner(file: &mut tokio::fs::File, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    // No cheap portable liveness check; never reclaim.
    true
}
