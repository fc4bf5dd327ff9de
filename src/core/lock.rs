/// Advisory lock keeping backup, restore and snapshot operations exclusive per deployment root

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::error::{OpsError, OpsResult};
use crate::utils::{sibling_path, LOCK_SUFFIX};

/// Held for the duration of one operation; released on drop
pub struct OperationLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl OperationLock {
    /// Take the lock for `deployment_root`, failing fast when another operation holds it
    pub fn acquire(deployment_root: &Path) -> OpsResult<Self> {
        let path = sibling_path(deployment_root, LOCK_SUFFIX);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(OpsError::AlreadyInProgress(deployment_root.to_path_buf()))
            }
            Err((_, errno)) => return Err(OpsError::Io(std::io::Error::from(errno))),
        };

        // Holder pid is informational only; the flock is what excludes
        lock.set_len(0)?;
        writeln!(&mut *lock, "{}", std::process::id())?;

        debug!("Acquired operation lock {}", path.display());
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        debug!("Releasing operation lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("stack");
        std::fs::create_dir_all(&root).unwrap();

        let first = OperationLock::acquire(&root).unwrap();
        assert!(first.path().ends_with("stack.stackguard.lock"));

        match OperationLock::acquire(&root) {
            Err(OpsError::AlreadyInProgress(p)) => assert_eq!(p, root),
            other => panic!("expected AlreadyInProgress, got {:?}", other.map(|_| ())),
        }

        drop(first);
        assert!(OperationLock::acquire(&root).is_ok());
    }

    #[test]
    fn test_locks_are_per_root() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");

        let _la = OperationLock::acquire(&a).unwrap();
        assert!(OperationLock::acquire(&b).is_ok());
    }
}
