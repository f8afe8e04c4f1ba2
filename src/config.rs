//! Configuration loaded from a TOML file.
//!
//! Every field has a default, so an empty or missing file yields a working
//! configuration for a stock appliance layout.

use crate::error::{ReplicationError, Result};
use crate::streaming::channel::{DATA_CHUNK_SIZE, HANDSHAKE_POLL, MAX_SEND_ATTEMPTS, REPLY_TIMEOUT};
use crate::streaming::protocol::MAX_FRAME_SIZE;
use crate::streaming::sender::SenderConfig;
use crate::task::{ReplicationTask, DEFAULT_RECEIVER_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var naming the config file when none is given on the command line
pub const CONFIG_ENV: &str = "SNAPREP_CONFIG";

const DEFAULT_BTRFS: &str = "/sbin/btrfs";
const DEFAULT_MNT_ROOT: &str = "/mnt2";
const DEFAULT_STATE_DIR: &str = "/var/lib/snaprep";

/// Largest chunk that still fits a frame with its command token
const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE as usize - 256;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sender: SenderSettings,
    pub receiver: ReceiverSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    pub max_send_attempts: u32,
    pub reply_timeout_secs: u64,
    pub handshake_poll_secs: u64,
    /// Max bytes per data frame
    pub chunk_size: usize,
    pub btrfs: PathBuf,
    pub mnt_root: PathBuf,
    pub state_dir: PathBuf,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            max_send_attempts: MAX_SEND_ATTEMPTS,
            reply_timeout_secs: REPLY_TIMEOUT.as_secs(),
            handshake_poll_secs: HANDSHAKE_POLL.as_secs(),
            chunk_size: DATA_CHUNK_SIZE,
            btrfs: PathBuf::from(DEFAULT_BTRFS),
            mnt_root: PathBuf::from(DEFAULT_MNT_ROOT),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl SenderSettings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    /// Round configuration for one appliance.
    pub fn sender_config(&self, appliance_uuid: &str) -> SenderConfig {
        let mut config = SenderConfig::new(appliance_uuid);
        config.max_send_attempts = self.max_send_attempts;
        config.handshake_poll = Duration::from_secs(self.handshake_poll_secs);
        config.chunk_size = self.chunk_size;
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    pub listen: String,
    pub btrfs: PathBuf,
    pub mnt_root: PathBuf,
    pub state_dir: PathBuf,
    /// Received replication snapshots kept per destination share
    pub max_snap_retain: usize,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_RECEIVER_PORT),
            btrfs: PathBuf::from(DEFAULT_BTRFS),
            mnt_root: PathBuf::from(DEFAULT_MNT_ROOT),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            max_snap_retain: 5,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(text).map_err(|e| ReplicationError::Config(e.to_string()))?;
        config.validate()?;
        config.expand_paths();
        Ok(config)
    }

    /// Load from `path`, falling back to `$SNAPREP_CONFIG`. With neither set
    /// the defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        };
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let path = expand_tilde(&path);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            ReplicationError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        let chunk_size = self.sender.chunk_size;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(ReplicationError::Config(format!(
                "sender.chunk_size must be between 1 and {} bytes, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        for p in [
            &mut self.sender.btrfs,
            &mut self.sender.mnt_root,
            &mut self.sender.state_dir,
            &mut self.receiver.btrfs,
            &mut self.receiver.mnt_root,
            &mut self.receiver.state_dir,
        ] {
            *p = expand_tilde(p);
        }
    }
}

/// Read a task description file.
pub fn load_task(path: &Path) -> Result<ReplicationTask> {
    let path = expand_tilde(path);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        ReplicationError::Config(format!("Failed to read task {}: {}", path.display(), e))
    })?;
    let task: ReplicationTask = toml::from_str(&text)
        .map_err(|e| ReplicationError::Config(format!("Invalid task {}: {}", path.display(), e)))?;
    if task.share.is_empty() || task.pool.is_empty() || task.dest_pool.is_empty() {
        return Err(ReplicationError::Config(format!(
            "Task {} needs share, pool and dest_pool",
            task.id
        )));
    }
    Ok(task)
}

/// Expand `~` and `~/...` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}
