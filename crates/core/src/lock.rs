use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const LOCK_FILE_NAME: &str = ".rawvert.lock";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run appears to be active in this directory (lock file {path}); remove it if no run is in progress")]
    Held { path: PathBuf },
    #[error("failed to create lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub run_id: String,
    pub pid: u32,
    pub started_at: String,
}

#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    pub fn acquire(root: &Path, run_id: &str) -> Result<Self, LockError> {
        let path = root.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held { path });
            }
            Err(source) => return Err(LockError::Io { path, source }),
        };

        let info = LockInfo {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let lock = Self { path };
        // The lock holds from here on; its contents are informational.
        let body = serde_json::to_vec_pretty(&info).map_err(io::Error::from);
        if let Err(err) = body.and_then(|body| file.write_all(&body)) {
            warn!("failed to write lock details to {}: {}", lock.path.display(), err);
        }
        debug!("acquired {}", lock.path.display());
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to remove lock file {}: {}", self.path.display(), err);
        }
    }
}

pub fn read_lock(root: &Path) -> Option<LockInfo> {
    let text = fs::read_to_string(root.join(LOCK_FILE_NAME)).ok()?;
    serde_json::from_str(&text).ok()
}
