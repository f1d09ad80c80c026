//! Advisory lock files guarding shard writes.
//!
//! A lock is a sibling file `<shard>.lock` created with `create_new`, which is
//! atomic across processes sharing the cache directory. The file holds an
//! owner token. While the guard lives, a background task rewrites it every
//! half [`LockOptions::stale_after`] so its modification time stays fresh.
//! A lock whose modification time is older than `stale_after` was left by a
//! crashed writer and may be reclaimed.

use super::CacheError;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Give up acquiring after this long.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Treat an existing lock older than this as abandoned.
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(25),
            stale_after: Duration::from_secs(10),
        }
    }
}

impl LockOptions {
    fn refresh_interval(&self) -> Duration {
        (self.stale_after / 2).max(MIN_REFRESH_INTERVAL)
    }
}

/// Exclusive hold on one shard file. Released on drop.
#[derive(Debug)]
pub struct ShardLock {
    path: PathBuf,
    token: String,
    refresher: JoinHandle<()>,
    released: bool,
}

pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

impl ShardLock {
    /// Acquire the lock for `target`. The parent directory must already exist.
    pub async fn acquire(target: &Path, opts: &LockOptions) -> Result<Self, CacheError> {
        let path = lock_path_for(target);
        let token = format!("{}:{}", std::process::id(), uuid::Uuid::new_v4());
        let deadline = Instant::now() + opts.timeout;

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(token.as_bytes()).await?;
                    file.flush().await?;
                    debug!(lock = %path.display(), "shard lock acquired");
                    let refresher = tokio::spawn(keep_fresh(
                        path.clone(),
                        token.clone(),
                        opts.refresh_interval(),
                    ));
                    return Ok(Self {
                        path,
                        token,
                        refresher,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, opts.stale_after).await
                        && reclaim_stale(&path, opts.stale_after).await?
                    {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(CacheError::LockTimeout {
                            path: target.display().to_string(),
                        });
                    }
                    tokio::time::sleep(opts.poll_interval).await;
                }
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file if it still carries this guard's token.
    pub async fn release(mut self) -> Result<(), CacheError> {
        self.released = true;
        self.refresher.abort();
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content == self.token => {}
            Ok(_) => {
                warn!(lock = %self.path.display(), "shard lock was taken over before release");
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CacheError::Io(e)),
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }
}

impl Drop for ShardLock {
    fn drop(&mut self) {
        self.refresher.abort();
        if !self.released {
            let owned = std::fs::read_to_string(&self.path)
                .map(|content| content == self.token)
                .unwrap_or(false);
            if owned {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}

/// Rewrite the owner token in place until the lock is lost or the guard goes.
async fn keep_fresh(path: PathBuf, token: String, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        match touch_if_owned(&path, &token).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(lock = %path.display(), "shard lock no longer ours, stopping refresh");
                return;
            }
            Err(e) => warn!(lock = %path.display(), error = %e, "failed to refresh shard lock"),
        }
    }
}

async fn touch_if_owned(path: &Path, token: &str) -> std::io::Result<bool> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content == token => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    // Same bytes, no truncation: the content stays valid even if interrupted.
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.write_all(token.as_bytes()).await?;
    file.flush().await?;
    Ok(true)
}

/// Move a stale lock aside under a unique name and delete it.
///
/// Rename is atomic, so of several waiters that saw the same stale lock only
/// one moves it. The moved file is checked again: if it turns out to be a
/// fresh lock taken in between, it is linked back into place.
async fn reclaim_stale(path: &Path, stale_after: Duration) -> Result<bool, CacheError> {
    let mut aside = path.as_os_str().to_os_string();
    aside.push(format!(".{}.stale", uuid::Uuid::new_v4()));
    let aside = PathBuf::from(aside);

    match tokio::fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(CacheError::Io(e)),
    }

    if !is_stale(&aside, stale_after).await {
        match tokio::fs::hard_link(&aside, path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(lock = %path.display(), "could not restore a live shard lock");
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&aside).await;
                return Err(CacheError::Io(e));
            }
        }
        let _ = tokio::fs::remove_file(&aside).await;
        return Ok(false);
    }

    warn!(lock = %path.display(), "reclaimed stale shard lock");
    match tokio::fs::remove_file(&aside).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(CacheError::Io(e)),
    }
}

async fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}
