//! Exclusive lock client. The loader only needs acquire-with-timeout and release keyed by
//! module name (or scope); `FileLockService` implements that on a directory shared by every
//! process that loads into the same installation root.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{DmlError, Result};

const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Cross-process exclusive lock backend.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait up to `timeout` for exclusive ownership of `key`.
    async fn acquire_exclusive(&self, key: &str, owner: &str, timeout: Duration) -> Result<()>;

    /// Give up ownership of `key`. Fails when `owner` does not hold it.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;

    /// Whether anyone currently holds `key`.
    fn is_locked(&self, key: &str) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
    owner: String,
    pid: u32,
    acquired_at: u64,
}

/// Lock files under a shared directory: `<dir>/<key>.lock`, created with O_EXCL.
pub struct FileLockService {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileLockService {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scoped keys may contain separators; flatten them into one file name.
    pub fn lock_path(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{}.lock", file))
    }

    async fn try_create(&self, path: &Path, owner: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        let record = LockRecord {
            owner: owner.to_string(),
            pid: std::process::id(),
            acquired_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let body = serde_json::to_vec(&record).map_err(std::io::Error::other)?;
        file.write_all(&body).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl LockService for FileLockService {
    async fn acquire_exclusive(&self, key: &str, owner: &str, timeout: Duration) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DmlError::io("create lock dir", &self.dir, e))?;

        let path = self.lock_path(key);
        let started = Instant::now();
        loop {
            match self.try_create(&path, owner).await {
                Ok(()) => {
                    debug!(key, owner, "lock acquired");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= timeout {
                        return Err(DmlError::LockTimeout {
                            key: key.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                            message: format!("{} is held by another owner", path.display()),
                        });
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    return Err(DmlError::Lock {
                        key: key.to_string(),
                        message: format!("cannot create {}: {}", path.display(), e),
                    })
                }
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        let path = self.lock_path(key);
        let body = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DmlError::Lock {
                    key: key.to_string(),
                    message: "lock is not held".to_string(),
                })
            }
            Err(e) => return Err(DmlError::io("read lock file", path, e)),
        };
        // A record we cannot parse was half-written by a crashed holder; let the caller clear it.
        if let Ok(record) = serde_json::from_slice::<LockRecord>(&body) {
            if record.owner != owner {
                return Err(DmlError::Lock {
                    key: key.to_string(),
                    message: format!("lock is held by '{}', not '{}'", record.owner, owner),
                });
            }
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| DmlError::io("remove lock file", &path, e))?;
        debug!(key, owner, "lock released");
        Ok(())
    }

    fn is_locked(&self, key: &str) -> bool {
        self.lock_path(key).exists()
    }
}
