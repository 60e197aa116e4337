//! Cross-process single-flight guard for an install directory.
//!
//! The lock is a file created with `create_new`, so exactly one process wins.
//! It records the owner pid and acquisition time; a lock older than the
//! configured stale age is assumed to belong to a crashed process and is
//! reclaimed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::UpdateError;

/// Lock file name at the install root.
pub const LOCK_FILE_NAME: &str = ".wfl-update.lock";

/// Default age after which a lock is considered abandoned (6 hours).
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held lock on an install directory. Released on drop.
#[derive(Debug)]
pub struct UpdateLock {
    path: PathBuf,
}

impl UpdateLock {
    /// Take the lock for `install_root`.
    ///
    /// Fails with [`UpdateError::UpdateInProgress`] while another live
    /// holder exists.
    pub fn acquire(install_root: &Path, stale_after: Duration) -> Result<Self, UpdateError> {
        fs::create_dir_all(install_root)?;
        let path = install_root.join(LOCK_FILE_NAME);

        match Self::try_create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if !Self::is_stale(&path, stale_after) {
            return Err(UpdateError::UpdateInProgress(
                install_root.display().to_string(),
            ));
        }

        warn!(path = %path.display(), "reclaiming stale update lock");
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Another process may reclaim it first; that one wins.
        Self::try_create(&path).map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                UpdateError::UpdateInProgress(install_root.display().to_string())
            } else {
                e.into()
            }
        })
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_vec(&info).map_err(std::io::Error::other)?;
        if let Err(e) = file.write_all(&json).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(path);
            return Err(e);
        }
        debug!(path = %path.display(), pid = info.pid, "update lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn is_stale(path: &Path, stale_after: Duration) -> bool {
        let acquired_at = fs::read(path)
            .ok()
            .and_then(|data| serde_json::from_slice::<LockInfo>(&data).ok())
            .map(|info| info.acquired_at);

        let acquired_at = match acquired_at {
            Some(t) => t,
            // Unreadable content: judge by modification time.
            None => match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(modified) => DateTime::<Utc>::from(modified),
                Err(_) => return false,
            },
        };

        let age = Utc::now().signed_duration_since(acquired_at);
        age.to_std().map(|age| age > stale_after).unwrap_or(false)
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release update lock");
            }
        } else {
            debug!(path = %self.path.display(), "update lock released");
        }
    }
}
