use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// Default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Polling interval while waiting for a contended lock.
const ACQUIRE_POLL: Duration = Duration::from_millis(10);

/// Cross-process cooperative file lock on a `<name>.lock` sentinel.
///
/// The lock is held for the lifetime of the value and released on drop
/// (including unwind paths), when the sentinel fd closes.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    exclusive: bool,
}

/// The sentinel path guarding `target`.
pub fn sentinel_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "resource".to_string());
    target.with_file_name(format!("{name}.lock"))
}

impl FileLock {
    /// Acquire an exclusive lock on the sentinel for `target`.
    pub fn acquire(target: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire_inner(target, timeout, true)
    }

    /// Acquire a shared lock on the sentinel for `target`.
    pub fn acquire_shared(target: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire_inner(target, timeout, false)
    }

    fn acquire_inner(target: &Path, timeout: Duration, exclusive: bool) -> Result<Self> {
        let sentinel = sentinel_path(target);
        if let Some(parent) = sentinel.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Lock(format!("failed to create lock dir: {e}")))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&sentinel)
            .map_err(|e| Error::Lock(format!("failed to open {}: {e}", sentinel.display())))?;

        let mode = if exclusive {
            libc::LOCK_EX
        } else {
            libc::LOCK_SH
        };

        let deadline = Instant::now() + timeout;
        loop {
            let ret = unsafe { libc::flock(file.as_raw_fd(), mode | libc::LOCK_NB) };
            if ret == 0 {
                debug!(path = %sentinel.display(), exclusive, "lock acquired");
                return Ok(Self {
                    file,
                    path: sentinel,
                    exclusive,
                });
            }
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(Error::Lock(format!(
                    "flock on {} failed: {errno}",
                    sentinel.display()
                )));
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout {
                    path: sentinel,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(ACQUIRE_POLL);
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn sentinel(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        debug!(path = %self.path.display(), "lock released");
    }
}

/// Write `bytes` to `target` atomically: temp file in the same directory,
/// write + fsync, rename over the target. The temp file is unlinked on error.
pub fn atomic_write(target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| Error::Lock(format!("{} has no parent", target.display())))?;
    std::fs::create_dir_all(dir)?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let tmp = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, target)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Read `path` as JSON under a shared lock. Missing file yields `Value::Null`.
pub fn locked_json_read(path: &Path, timeout: Duration) -> Result<Value> {
    let _lock = FileLock::acquire_shared(path, timeout)?;
    read_json_unlocked(path)
}

/// Read-modify-write `path` as JSON under an exclusive lock.
///
/// `updater` receives the current content (`Value::Null` when the file is
/// absent or empty) and returns the replacement, which is written atomically
/// before the lock is released. Every piece of cross-process state in the
/// system goes through this function.
pub fn locked_json_update<F>(path: &Path, timeout: Duration, updater: F) -> Result<Value>
where
    F: FnOnce(Value) -> Value,
{
    let _lock = FileLock::acquire(path, timeout)?;
    let current = read_json_unlocked(path)?;
    let updated = updater(current);
    let bytes = serde_json::to_vec_pretty(&updated)?;
    atomic_write(path, &bytes)?;
    Ok(updated)
}

fn read_json_unlocked(path: &Path) -> Result<Value> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(Value::Null),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Null),
        Err(e) => Err(e.into()),
    }
}
