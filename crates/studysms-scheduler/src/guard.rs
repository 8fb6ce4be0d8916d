//! Lock file that keeps two dispatch runs from overlapping.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use studysms_core::{Result, StudySmsError};

/// Held for the length of a dispatch run; the lock file is removed on drop.
#[derive(Debug)]
pub struct RunGuard {
    path: PathBuf,
}

impl RunGuard {
    /// Create `path` exclusively. A lock older than `stale_after` is assumed
    /// abandoned by a crashed run and taken over.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        match Self::create(path) {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let age = lock_age(path);
                if age.is_some_and(|age| age >= stale_after) {
                    tracing::warn!(
                        "⚠️ Taking over stale dispatch lock {} ({}s old)",
                        path.display(),
                        age.map(|a| a.as_secs()).unwrap_or_default()
                    );
                    std::fs::remove_file(path)?;
                    return Self::create(path).map_err(|e| lock_error(path, e));
                }
                Err(StudySmsError::Busy(format!(
                    "lock file {} is held by another run",
                    path.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!("Dispatch lock acquired: {}", path.display());
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove dispatch lock {}: {e}", self.path.display());
        }
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn lock_error(path: &Path, e: std::io::Error) -> StudySmsError {
    if e.kind() == ErrorKind::AlreadyExists {
        StudySmsError::Busy(format!("lock file {} is held by another run", path.display()))
    } else {
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path(test: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("studysms-guard-{test}"));
        std::fs::create_dir_all(&dir).ok();
        dir.join("participants.db.lock")
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let path = lock_path("busy");
        let hour = Duration::from_secs(3600);
        let guard = RunGuard::acquire(&path, hour).unwrap();
        assert!(path.exists());

        let err = RunGuard::acquire(&path, hour).unwrap_err();
        assert!(matches!(err, StudySmsError::Busy(_)));

        drop(guard);
        assert!(!path.exists());
        assert!(RunGuard::acquire(&path, hour).is_ok());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_stale_lock_taken_over() {
        let path = lock_path("stale");
        std::fs::write(&path, "12345\n").unwrap();
        // Zero tolerance: any existing lock counts as stale.
        let guard = RunGuard::acquire(&path, Duration::ZERO).unwrap();
        assert_eq!(guard.path(), path.as_path());
        drop(guard);
        assert!(!path.exists());
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
