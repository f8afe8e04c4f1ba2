//! Per-task single-flight guard.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock held for the duration of one round of a task.
///
/// Released when dropped (closing the file drops the lock).
#[derive(Debug)]
pub struct TaskLock {
    file: File,
    path: PathBuf,
}

impl TaskLock {
    /// Try to take the lock for `identity`. Returns `Ok(None)` when another
    /// round of the same task holds it.
    pub fn try_acquire(state_dir: &Path, identity: &str) -> Result<Option<Self>> {
        let dir = state_dir.join("locks");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create lock dir {}", dir.display()))?;
        let path = dir.join(format!("{}.lock", identity));
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
