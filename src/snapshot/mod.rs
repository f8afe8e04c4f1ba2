//! Local snapshot management.
//!
//! The replication engine only needs a handful of snapshot operations; they are
//! expressed as the [`SnapshotManager`] trait so the engine can be driven by
//! the real btrfs tooling or by a test double.

mod btrfs;

pub use btrfs::{parse_subvolume_list, select_oldest, BtrfsSnapshots, SubvolumeEntry};

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A share (btrfs subvolume) inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Share {
    pub pool: String,
    pub name: String,
}

impl Share {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
pub trait SnapshotManager: Send + Sync {
    /// Mount point of a pool
    fn pool_path(&self, pool: &str) -> PathBuf;

    fn share_path(&self, share: &Share) -> PathBuf {
        self.pool_path(&share.pool).join(&share.name)
    }

    /// Directory holding the snapshots of a share
    fn snapshot_dir(&self, share: &Share) -> PathBuf {
        self.pool_path(&share.pool)
            .join(".snapshots")
            .join(&share.name)
    }

    fn snapshot_path(&self, share: &Share, name: &str) -> PathBuf {
        self.snapshot_dir(share).join(name)
    }

    /// Create a read-only snapshot of `share` called `name`.
    async fn create_snapshot(&self, share: &Share, name: &str) -> Result<()>;

    /// Delete a snapshot. Returns `false` if it did not exist.
    async fn delete_snapshot(&self, share: &Share, name: &str) -> Result<bool>;

    async fn snapshot_exists(&self, path: &Path) -> bool;

    /// Name of the oldest snapshot matching `pattern` when more than
    /// `retain` such snapshots exist, `None` otherwise.
    async fn oldest_prunable_snapshot(
        &self,
        share: &Share,
        retain: usize,
        pattern: &str,
    ) -> Result<Option<String>>;
}
