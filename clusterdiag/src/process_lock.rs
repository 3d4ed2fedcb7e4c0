//! Host-local process lock for the instance agent.
//!
//! Lock strategy:
//! - `clusterdiag-agent.lock.<digest>` marks a running `clusterdiag run`
//!   for one (store root, instance id) pair.
//! - Locks are advisory OS file locks (flock), held for process lifetime.
//! - This only stops two schedulers on the same host from racing each other;
//!   cross-instance exclusion is the session lock in clusterdiag-core.

use anyhow::{Context, Result};
use clusterdiag_core::types::fold_instance_name;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const AGENT_LOCK_FILE: &str = "clusterdiag-agent.lock";

/// Guard held by `clusterdiag run` for its lifetime.
pub struct AgentGuard {
    _lock: ProcessLock,
}

/// Acquire the agent lock for this store and instance.
///
/// Fails if another agent for the same instance is already running.
pub fn acquire_agent_guard(store_root: &Path, instance_id: &str) -> Result<AgentGuard> {
    match try_acquire_lock(AGENT_LOCK_FILE, store_root, instance_id)? {
        Some(lock) => Ok(AgentGuard { _lock: lock }),
        None => anyhow::bail!(
            "another clusterdiag agent for instance {} is already running",
            instance_id
        ),
    }
}

struct ProcessLock {
    file: File,
    path: PathBuf,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        // Best-effort cleanup of lock file itself (not required for correctness).
        let _ = fs::remove_file(&self.path);
    }
}

fn try_acquire_lock(
    filename: &str,
    store_root: &Path,
    instance_id: &str,
) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(filename, store_root, instance_id));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Write basic owner info for debugging.
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={} instance={}", std::process::id(), instance_id);
            let _ = file.flush();

            Ok(Some(ProcessLock { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("clusterdiag");
    dir
}

fn scoped_lock_filename(base_filename: &str, store_root: &Path, instance_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    store_root.to_string_lossy().hash(&mut hasher);
    fold_instance_name(instance_id).hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
unsafe extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("clusterdiag agent locks currently require Unix (macOS/Linux)");
