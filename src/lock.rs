//! File-based locking to keep a single guard per host.
//!
//! Two guards would fight over the same table, each evicting the other's
//! entries, so `run` holds an flock-style advisory lock for its lifetime.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Lock file used by `destguard run`.
pub const LOCK_FILE: &str = "/run/destguard.lock";

/// Holds an exclusive lock; released when dropped.
pub struct LockGuard {
    _file: File,
}

impl LockGuard {
    /// Acquire the lock at [`LOCK_FILE`].
    ///
    /// # Returns
    /// A guard holding the lock, or an error if another instance holds it
    pub fn acquire() -> Result<Self> {
        Self::acquire_at(Path::new(LOCK_FILE))
    }

    /// Attempt to acquire an exclusive lock on `lock_path`.
    ///
    /// The file is created with mode 0600 if missing. The lock is
    /// non-blocking.
    ///
    /// # Arguments
    /// * `lock_path` - Lock file to open or create
    ///
    /// # Returns
    /// A guard holding the lock. Fails if another instance is already
    /// running or if the file cannot be opened.
    pub fn acquire_at(lock_path: &Path) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).ok();
        }

        // create+read+write without truncate: no race between create and lock
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {}", lock_path.display()))?;

        fs::set_permissions(lock_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another instance of destguard is already running.\n\
                 If you believe this is an error, remove the lock file: {}",
                lock_path.display()
            )
        })?;

        Ok(Self { _file: file })
    }
}
