//! Advisory exclusive file locking for cross-process mutation of the
//! JobStore and access-store files.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

/// Holds an acquired advisory lock for as long as it is alive. Releases the
/// lock on drop, including when the holder panics.
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Acquire a blocking exclusive lock on `path`, creating it if missing.
fn acquire_blocking(path: &Path) -> anyhow::Result<LockGuard> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()?;
    Ok(LockGuard { file })
}

/// Run `f` while holding a blocking exclusive lock on `path`. Used on the
/// JobStore and access-store data paths, where callers must wait their turn
/// rather than fail.
pub fn with_lock<T>(path: &Path, f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    let _guard = acquire_blocking(path)?;
    f()
}

/// Acquire a non-blocking exclusive lock on `path`, failing fast with a
/// distinguishable error if another process already holds it. Used by
/// long-lived processes (the worker, the callback server) as a
/// single-instance guard.
pub fn try_lock_single_instance(path: &Path) -> anyhow::Result<LockGuard> {
    let file = open_lock_file(path)?;
    file.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "Another clipdrop instance is already running (lock: {})",
            path.display()
        )
    })?;
    Ok(LockGuard { file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_lock_creates_parent_dirs_and_runs_closure() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("nested").join(".lock");

        let result = with_lock(&lock_path, || Ok(42)).unwrap();
        assert_eq!(result, 42);
        assert!(lock_path.exists());
    }

    #[test]
    fn try_lock_single_instance_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".instance.lock");

        let guard = try_lock_single_instance(&lock_path).unwrap();
        let second = try_lock_single_instance(&lock_path);
        assert!(second.is_err());
        drop(guard);

        assert!(try_lock_single_instance(&lock_path).is_ok());
    }
}
