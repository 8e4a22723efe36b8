//! Exclusive run lock in the state directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use catalogsync_shared::{CatalogSyncError, Result};

/// Lock file name inside the state directory.
pub const LOCK_FILE_NAME: &str = "run.lock";

/// Held for the duration of a run. Removing the file on drop releases it.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock for `run_id`.
    ///
    /// An existing lock is only removed when `break_stale` is set and the lock is
    /// older than `stale_after`.
    pub fn acquire(
        state_dir: &Path,
        run_id: &str,
        stale_after: Duration,
        break_stale: bool,
    ) -> Result<Self> {
        std::fs::create_dir_all(state_dir).map_err(|e| CatalogSyncError::io(state_dir, e))?;
        let path = state_dir.join(LOCK_FILE_NAME);

        match Self::create(&path, run_id) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                let age = lock_age(&path);

                if !break_stale {
                    return Err(CatalogSyncError::RunLocked(format!(
                        "{} is held by {}; pass --break-lock if that run is dead",
                        path.display(),
                        holder.trim()
                    )));
                }
                if age.is_some_and(|age| age < stale_after) {
                    return Err(CatalogSyncError::RunLocked(format!(
                        "{} is held by {} and is not stale yet",
                        path.display(),
                        holder.trim()
                    )));
                }

                tracing::warn!(path = %path.display(), holder = holder.trim(), "breaking stale run lock");
                std::fs::remove_file(&path).map_err(|e| CatalogSyncError::io(&path, e))?;
                Self::create(&path, run_id).map_err(|e| CatalogSyncError::io(&path, e))
            }
            Err(e) => Err(CatalogSyncError::io(&path, e)),
        }
    }

    fn create(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(file, "run {run_id} (pid {})", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_state_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cs-lock-{}", Uuid::now_v7()))
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = temp_state_dir();
        let lock = RunLock::acquire(&dir, "r1", Duration::from_secs(3600), false).unwrap();
        assert!(lock.path().exists());

        let err = RunLock::acquire(&dir, "r2", Duration::from_secs(3600), false).unwrap_err();
        assert!(matches!(err, CatalogSyncError::RunLocked(_)));
        assert!(err.to_string().contains("run r1"));

        drop(lock);
        let again = RunLock::acquire(&dir, "r3", Duration::from_secs(3600), false);
        assert!(again.is_ok());
        drop(again);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn fresh_lock_is_not_broken() {
        let dir = temp_state_dir();
        let _held = RunLock::acquire(&dir, "r1", Duration::from_secs(3600), false).unwrap();
        let err = RunLock::acquire(&dir, "r2", Duration::from_secs(3600), true).unwrap_err();
        assert!(err.to_string().contains("not stale"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_lock_can_be_broken() {
        let dir = temp_state_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOCK_FILE_NAME), "run dead (pid 1)\n").unwrap();

        let lock = RunLock::acquire(&dir, "r2", Duration::ZERO, true).unwrap();
        let holder = std::fs::read_to_string(lock.path()).unwrap();
        assert!(holder.contains("run r2"));
        drop(lock);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
