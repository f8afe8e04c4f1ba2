//! Snapshot management by shelling out to `btrfs`.

use super::{Share, SnapshotManager};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

/// One line of `btrfs subvolume list -s` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeEntry {
    pub id: u64,
    /// Path relative to the filesystem top level
    pub path: String,
}

impl SubvolumeEntry {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

fn list_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ID (\d+) .*\bpath (.+)$").expect("subvolume list regex is valid")
    })
}

/// Parse `btrfs subvolume list` output, skipping lines that don't describe
/// a subvolume.
pub fn parse_subvolume_list(output: &str) -> Vec<SubvolumeEntry> {
    output
        .lines()
        .filter_map(|line| {
            let caps = list_line_regex().captures(line.trim())?;
            let id = caps[1].parse().ok()?;
            let path = caps[2].trim_start_matches("<FS_TREE>/").to_string();
            Some(SubvolumeEntry { id, path })
        })
        .collect()
}

/// Pick the oldest (lowest id) snapshot of `share` whose name matches
/// `pattern`, provided more than `retain` of them exist.
pub fn select_oldest(
    entries: &[SubvolumeEntry],
    share: &str,
    retain: usize,
    pattern: &glob::Pattern,
) -> Option<String> {
    let prefix = format!(".snapshots/{}/", share);
    let mut matching: Vec<&SubvolumeEntry> = entries
        .iter()
        .filter(|e| e.path.starts_with(&prefix) && pattern.matches(e.name()))
        .collect();
    if matching.len() <= retain {
        return None;
    }
    matching.sort_by_key(|e| e.id);
    matching.first().map(|e| e.name().to_string())
}

/// [`SnapshotManager`] backed by the `btrfs` command line tool.
#[derive(Debug, Clone)]
pub struct BtrfsSnapshots {
    btrfs: PathBuf,
    mnt_root: PathBuf,
}

impl BtrfsSnapshots {
    pub fn new(btrfs: impl Into<PathBuf>, mnt_root: impl Into<PathBuf>) -> Self {
        Self {
            btrfs: btrfs.into(),
            mnt_root: mnt_root.into(),
        }
    }

    async fn run(&self, args: &[&OsStr]) -> Result<String> {
        let output = Command::new(&self.btrfs)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.btrfs.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} {:?} failed ({}): {}",
                self.btrfs.display(),
                args,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SnapshotManager for BtrfsSnapshots {
    fn pool_path(&self, pool: &str) -> PathBuf {
        self.mnt_root.join(pool)
    }

    async fn create_snapshot(&self, share: &Share, name: &str) -> Result<()> {
        let dir = self.snapshot_dir(share);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let src = self.share_path(share);
        let dst = dir.join(name);
        self.run(&[
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            OsStr::new("-r"),
            src.as_os_str(),
            dst.as_os_str(),
        ])
        .await
        .with_context(|| format!("Failed to snapshot {} as {}", src.display(), name))?;

        tracing::debug!("Created snapshot {}", dst.display());
        Ok(())
    }

    async fn delete_snapshot(&self, share: &Share, name: &str) -> Result<bool> {
        let path = self.snapshot_path(share, name);
        if !self.snapshot_exists(&path).await {
            return Ok(false);
        }
        self.run(&[OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()])
            .await
            .with_context(|| format!("Failed to delete snapshot {}", path.display()))?;

        tracing::debug!("Deleted snapshot {}", path.display());
        Ok(true)
    }

    async fn snapshot_exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn oldest_prunable_snapshot(
        &self,
        share: &Share,
        retain: usize,
        pattern: &str,
    ) -> Result<Option<String>> {
        let pattern = glob::Pattern::new(pattern)
            .with_context(|| format!("Invalid snapshot pattern {}", pattern))?;
        let pool = self.pool_path(&share.pool);
        let out = self
            .run(&[
                OsStr::new("subvolume"),
                OsStr::new("list"),
                OsStr::new("-s"),
                pool.as_os_str(),
            ])
            .await?;
        Ok(select_oldest(
            &parse_subvolume_list(&out),
            &share.name,
            retain,
            &pattern,
        ))
    }
}
