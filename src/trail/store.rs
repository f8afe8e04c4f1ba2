// File-backed trail store
//
// Keeps every trail as one JSON line in {state_dir}/trails.lst. Each operation
// takes an advisory lock on a sidecar file, reloads, and rewrites atomically, so
// a sender process and a status reader can share the file safely.

use super::{ReplicaTrail, TrailStore, TrailUpdate};
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub struct FileTrailStore {
    trail_file: PathBuf,
    lock_file: PathBuf,
}

impl FileTrailStore {
    /// Format version
    const FORMAT_VERSION: &'static str = "v1";

    /// Open or create the store under `state_dir`
    pub fn open(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state dir {}", state_dir.display()))?;
        Ok(Self {
            trail_file: state_dir.join("trails.lst"),
            lock_file: state_dir.join("trails.lock"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.trail_file
    }

    fn lock(&self, exclusive: bool) -> Result<fs::File> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_file)
            .with_context(|| format!("Failed to open {}", self.lock_file.display()))?;
        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(file)
    }

    fn load(&self) -> Result<Vec<ReplicaTrail>> {
        if !self.trail_file.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(fs::File::open(&self.trail_file)?);
        let mut trails = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();

            // Skip comments and blank lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let trail: ReplicaTrail = serde_json::from_str(line).with_context(|| {
                format!(
                    "Corrupt trail record at {}:{}",
                    self.trail_file.display(),
                    lineno + 1
                )
            })?;
            trails.push(trail);
        }
        Ok(trails)
    }

    /// Save all trails (atomic write)
    fn save(&self, trails: &[ReplicaTrail]) -> Result<()> {
        let temp_file = self.trail_file.with_extension("tmp");

        {
            let mut file = fs::File::create(&temp_file)?;
            writeln!(file, "# snaprep trails {}", Self::FORMAT_VERSION)?;
            writeln!(file, "# last_write: {}", chrono::Utc::now().to_rfc3339())?;
            for trail in trails {
                serde_json::to_writer(&mut file, trail)?;
                writeln!(file)?;
            }
            file.sync_all()?;
        }

        fs::rename(&temp_file, &self.trail_file)?;
        Ok(())
    }
}

impl TrailStore for FileTrailStore {
    fn create_replica_trail(&self, task: &str, snap_name: &str) -> Result<u64> {
        let _guard = self.lock(true)?;
        let mut trails = self.load()?;
        let id = trails.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        trails.push(ReplicaTrail::new(id, task, snap_name));
        self.save(&trails)?;
        Ok(id)
    }

    fn update_replica_status(&self, trail_id: u64, update: TrailUpdate) -> Result<()> {
        let _guard = self.lock(true)?;
        let mut trails = self.load()?;
        let trail = trails
            .iter_mut()
            .find(|t| t.id == trail_id)
            .with_context(|| format!("No trail with id {}", trail_id))?;
        trail.apply(&update)?;
        self.save(&trails)
    }

    fn list_trails(&self, task: &str) -> Result<Vec<ReplicaTrail>> {
        let _guard = self.lock(false)?;
        let mut trails: Vec<ReplicaTrail> = self
            .load()?
            .into_iter()
            .filter(|t| t.task == task)
            .collect();
        trails.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(trails)
    }
}
