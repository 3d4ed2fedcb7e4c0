//! Per-session mutual exclusion on shared storage
//!
//! Lock strategy:
//! - A session's lock is a marker file `active/<SessionId>.json.lock`.
//! - Acquisition is one exclusive create (`O_CREAT | O_EXCL`); two concurrent
//!   creators can never both succeed.
//! - The marker holds the owner tag of the operation that created it. Release
//!   only deletes a marker carrying the caller's own tag.
//! - Callers retry on a fixed interval. When the budget runs out the marker
//!   is presumed orphaned (its holder crashed), force-deleted, and the pending
//!   update is abandoned for this attempt.
//!
//! Every acquisition gets its own [`LockGuard`] with a fresh owner tag, so one
//! operation's release can never remove a marker another operation holds.
//! [`SessionLock`] itself is synchronous; [`LockPolicy`] and [`LockGuard`]
//! run it on tokio's blocking pool.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::LockConfig;

/// Atomic acquire/release of a named lock.
///
/// Implementations must make [`SessionLock::try_acquire`] a single atomic
/// operation.
pub trait SessionLock: Send + Sync {
    /// Attempt once to take the lock for `key`, tagging it with `owner`.
    fn try_acquire(&self, key: &str, owner: &str) -> io::Result<bool>;

    /// Release the lock if `owner` holds it. Returns whether a marker was removed.
    fn release(&self, key: &str, owner: &str) -> io::Result<bool>;

    /// Remove the lock regardless of owner.
    fn force_release(&self, key: &str) -> io::Result<()>;

    /// Whether any owner currently holds `key`.
    fn is_held(&self, key: &str) -> io::Result<bool>;
}

// ============================================
// File-system lock
// ============================================

/// Marker-file lock living next to the session records.
#[derive(Debug, Clone)]
pub struct FileSessionLock {
    dir: PathBuf,
}

impl FileSessionLock {
    /// Locks whose markers live in `dir` (normally the active store directory).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the marker file for `key`.
    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json.lock", key))
    }
}

impl SessionLock for FileSessionLock {
    fn try_acquire(&self, key: &str, owner: &str) -> io::Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let path = self.marker_path(key);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                // Owner tag is what release() checks against.
                file.write_all(owner.as_bytes())?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn release(&self, key: &str, owner: &str) -> io::Result<bool> {
        let path = self.marker_path(key);
        match read_owner(&path)? {
            Some(current) if current == owner => {
                remove_marker(&path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn force_release(&self, key: &str) -> io::Result<()> {
        remove_marker(&self.marker_path(key))
    }

    fn is_held(&self, key: &str) -> io::Result<bool> {
        Ok(self.marker_path(key).exists())
    }
}

fn read_owner(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_marker(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// ============================================
// In-memory lock
// ============================================

/// Process-local lock table with the same contract as [`FileSessionLock`].
///
/// Useful for embedding several coordinators in one process and for tests.
#[derive(Debug, Default)]
pub struct MemorySessionLock {
    held: Mutex<HashMap<String, String>>,
}

impl MemorySessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.held
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "lock table poisoned"))
    }
}

impl SessionLock for MemorySessionLock {
    fn try_acquire(&self, key: &str, owner: &str) -> io::Result<bool> {
        let mut held = self.table()?;
        if held.contains_key(key) {
            return Ok(false);
        }
        held.insert(key.to_string(), owner.to_string());
        Ok(true)
    }

    fn release(&self, key: &str, owner: &str) -> io::Result<bool> {
        let mut held = self.table()?;
        if held.get(key).map(String::as_str) == Some(owner) {
            held.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    fn force_release(&self, key: &str) -> io::Result<()> {
        self.table()?.remove(key);
        Ok(())
    }

    fn is_held(&self, key: &str) -> io::Result<bool> {
        Ok(self.table()?.contains_key(key))
    }
}

// ============================================
// Acquisition policy
// ============================================

/// Bounded retry policy for taking a session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl From<&LockConfig> for LockPolicy {
    fn from(config: &LockConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_interval: config.retry_interval(),
        }
    }
}

impl LockPolicy {
    /// Acquire `key`, retrying per policy.
    ///
    /// Returns `Ok(None)` when the budget is exhausted. In that case the
    /// existing marker has been force-deleted as orphaned and the caller must
    /// skip its update.
    pub async fn acquire(
        &self,
        lock: &Arc<dyn SessionLock>,
        key: &str,
    ) -> io::Result<Option<LockGuard>> {
        let owner = uuid::Uuid::new_v4().to_string();

        for attempt in 1..=self.max_attempts {
            let (k, o) = (key.to_string(), owner.clone());
            if off_runtime(lock, move |l| l.try_acquire(&k, &o)).await? {
                tracing::debug!(key, attempt, "Lock acquired");
                return Ok(Some(LockGuard {
                    lock: Arc::clone(lock),
                    key: key.to_string(),
                    owner,
                    released: false,
                }));
            }

            tracing::debug!(key, attempt, "Lock busy, retrying");
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_interval).await;
            }
        }

        tracing::warn!(
            key,
            attempts = self.max_attempts,
            "Lock not released in time, presuming orphaned and reclaiming"
        );
        let k = key.to_string();
        off_runtime(lock, move |l| l.force_release(&k)).await?;
        Ok(None)
    }
}

/// Run a lock operation on the blocking pool; file locks do synchronous I/O.
async fn off_runtime<T, F>(lock: &Arc<dyn SessionLock>, op: F) -> io::Result<T>
where
    F: FnOnce(&dyn SessionLock) -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let lock = Arc::clone(lock);
    tokio::task::spawn_blocking(move || op(lock.as_ref()))
        .await
        .map_err(io::Error::other)?
}

/// Scoped ownership of one lock acquisition.
///
/// Release with [`LockGuard::release`]. A guard dropped without it (early
/// return, error, cancelled future) releases synchronously in `Drop`.
pub struct LockGuard {
    lock: Arc<dyn SessionLock>,
    key: String,
    owner: String,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    /// Release now. Returns whether our marker was still in place.
    pub async fn release(mut self) -> bool {
        self.released = true;
        let (key, owner) = (self.key.clone(), self.owner.clone());
        let result = off_runtime(&self.lock, move |l| l.release(&key, &owner)).await;
        self.report(result)
    }

    fn report(&self, result: io::Result<bool>) -> bool {
        match result {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(
                    key = %self.key,
                    owner = %self.owner,
                    "Lock marker was no longer ours at release"
                );
                false
            }
            Err(e) => {
                tracing::error!(key = %self.key, error = %e, "Failed to release lock");
                false
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let result = self.lock.release(&self.key, &self.owner);
        self.report(result);
    }
}
