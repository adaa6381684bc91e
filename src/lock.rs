//! Advisory lock next to the state file so two local runs cannot interleave.
//!
//! This guards the operator machine only. Nothing here locks the remote host.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Holds an exclusive lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Lock path used for a given state file (`state.json` -> `state.json.lock`).
    pub fn path_for(state_file: &Path) -> PathBuf {
        let mut name = state_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".lock");
        state_file.with_file_name(name)
    }

    /// Try to take the lock without blocking.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {:?}", parent))?;
        }

        // create+read+write without truncate: no window between create and lock
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        fs::set_permissions(lock_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another hostward run holds {:?}.\n\
                 Wait for it to finish, or remove the lock file if no run is active.",
                lock_path
            )
        })?;

        Ok(Self {
            _file: file,
            path: lock_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_for_state_file() {
        assert_eq!(
            LockGuard::path_for(Path::new("/var/lib/hostward/state.json")),
            PathBuf::from("/var/lib/hostward/state.json.lock")
        );
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json.lock");

        let guard = LockGuard::acquire(&path).unwrap();
        assert_eq!(guard.path(), path.as_path());
        assert!(LockGuard::acquire(&path).is_err());

        drop(guard);
        assert!(LockGuard::acquire(&path).is_ok());
    }

    #[test]
    fn test_lock_file_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.lock");
        let _guard = LockGuard::acquire(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
