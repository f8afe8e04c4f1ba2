//! Shared fixtures: directory-backed snapshots and shell producers/consumers
//! standing in for the btrfs tooling.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use snaprep::server::ReceiverServer;
use snaprep::snapshot::{Share, SnapshotManager};
use snaprep::streaming::{
    ConsumerHandle, Facade, ProducerHandle, ReceiverConfig, ReceiverFacade, SenderConfig,
    StreamConsumer, StreamProducer,
};
use snaprep::task::{parse_sequence, ReplicationTask};
use snaprep::trail::{FileTrailStore, ReplicaTrail, TrailStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

pub const UUID: &str = "appliance";

/// Snapshots as directories; a snapshot copies the share's top-level files.
pub struct DirSnapshots {
    pub root: PathBuf,
}

#[async_trait]
impl SnapshotManager for DirSnapshots {
    fn pool_path(&self, pool: &str) -> PathBuf {
        self.root.join(pool)
    }

    async fn create_snapshot(&self, share: &Share, name: &str) -> Result<()> {
        let dest = self.snapshot_path(share, name);
        std::fs::create_dir_all(&dest)?;
        let src = self.share_path(share);
        if src.is_dir() {
            for entry in std::fs::read_dir(src)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    std::fs::copy(entry.path(), dest.join(entry.file_name()))?;
                }
            }
        }
        Ok(())
    }

    async fn delete_snapshot(&self, share: &Share, name: &str) -> Result<bool> {
        let path = self.snapshot_path(share, name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(path)?;
        Ok(true)
    }

    async fn snapshot_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    async fn oldest_prunable_snapshot(
        &self,
        share: &Share,
        retain: usize,
        pattern: &str,
    ) -> Result<Option<String>> {
        let dir = self.snapshot_dir(share);
        if !dir.is_dir() {
            return Ok(None);
        }
        let pattern = glob::Pattern::new(pattern)?;
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if pattern.matches(&name) {
                names.push(name);
            }
        }
        if names.len() <= retain {
            return Ok(None);
        }
        names.sort_by_key(|n| parse_sequence(n).unwrap_or(0));
        Ok(names.into_iter().next())
    }
}

/// `sh -c script producer <snapshot> [<parent>]`
pub struct ShProducer {
    pub script: String,
    pub parents: Mutex<Vec<Option<PathBuf>>>,
}

impl ShProducer {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            parents: Mutex::new(Vec::new()),
        }
    }

    pub fn parent_names(&self) -> Vec<Option<String>> {
        self.parents
            .lock()
            .unwrap()
            .iter()
            .map(|p| {
                p.as_ref()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .collect()
    }
}

impl StreamProducer for ShProducer {
    fn spawn(&self, snapshot: &Path, parent: Option<&Path>) -> std::io::Result<ProducerHandle> {
        self.parents
            .lock()
            .unwrap()
            .push(parent.map(Path::to_path_buf));
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&self.script).arg("producer").arg(snapshot);
        if let Some(parent) = parent {
            cmd.arg(parent);
        }
        ProducerHandle::spawn(cmd)
    }
}

/// `sh -c script consumer <dest_dir> <snap>`
pub struct ShConsumer(pub String);

impl StreamConsumer for ShConsumer {
    fn spawn(&self, dest_dir: &Path, snap: &str) -> std::io::Result<ConsumerHandle> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.0)
            .arg("consumer")
            .arg(dest_dir)
            .arg(snap);
        ConsumerHandle::spawn(cmd)
    }
}

/// Streams the snapshot's `data` file
pub const SEND_DATA: &str = "cat \"$1/data\"";

/// Materializes the stream as `<dest>/<snap>/data`
pub const RECEIVE_DATA: &str = "mkdir \"$1/$2\" && cat > \"$1/$2/data\"";

pub fn task(port: u16) -> ReplicationTask {
    ReplicationTask {
        id: 7,
        share: "media".to_string(),
        pool: "tank".to_string(),
        dest_pool: "backup".to_string(),
        dest_share: None,
        receiver: "127.0.0.1".to_string(),
        receiver_port: port,
        max_snap_retain: 3,
    }
}

pub fn sender_config() -> SenderConfig {
    let mut config = SenderConfig::new(UUID);
    config.max_send_attempts = 3;
    config.handshake_poll = Duration::from_millis(200);
    config.producer_poll = Duration::from_millis(20);
    config.chunk_size = 4096;
    config
}

/// Source appliance: a share with a data file plus the sender's trail store.
pub struct SourceSide {
    pub dir: TempDir,
    pub snapshots: Arc<DirSnapshots>,
    pub trails: Arc<FileTrailStore>,
}

impl SourceSide {
    pub fn new(data: &[u8]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let share = dir.path().join("pools/tank/media");
        std::fs::create_dir_all(&share).unwrap();
        std::fs::write(share.join("data"), data).unwrap();
        Self {
            snapshots: Arc::new(DirSnapshots {
                root: dir.path().join("pools"),
            }),
            trails: Arc::new(FileTrailStore::open(&dir.path().join("state")).unwrap()),
            dir,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    pub fn facade(&self, producer: Arc<ShProducer>) -> Facade {
        Facade {
            snapshots: self.snapshots.clone(),
            trails: self.trails.clone(),
            producer,
        }
    }

    pub fn trails(&self) -> Vec<ReplicaTrail> {
        self.trails.list_trails(&format!("{}-7", UUID)).unwrap()
    }

    /// Latest succeeded trail, the prior a scheduler would hand the sender
    pub fn prior(&self) -> Option<ReplicaTrail> {
        self.trails
            .list_succeeded_trails(&format!("{}-7", UUID))
            .unwrap()
            .into_iter()
            .next()
    }
}

/// Destination appliance: a running receiver daemon on a loopback port.
pub struct TargetSide {
    pub dir: TempDir,
    pub addr: SocketAddr,
    pub trails: Arc<FileTrailStore>,
    stop: Option<oneshot::Sender<()>>,
}

impl TargetSide {
    pub async fn start(consumer: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pools/backup")).unwrap();
        let trails = Arc::new(FileTrailStore::open(&dir.path().join("state")).unwrap());
        let facade = ReceiverFacade {
            snapshots: Arc::new(DirSnapshots {
                root: dir.path().join("pools"),
            }),
            trails: trails.clone(),
            consumer: Arc::new(ShConsumer(consumer.to_string())),
        };
        let server = ReceiverServer::bind("127.0.0.1:0", ReceiverConfig::default(), facade)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(server.serve_until(async {
            let _ = rx.await;
        }));
        Self {
            dir,
            addr,
            trails,
            stop: Some(tx),
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.path().join("pools/backup/.snapshots/media")
    }

    pub fn trails(&self) -> Vec<ReplicaTrail> {
        self.trails.list_trails(&format!("{}-7", UUID)).unwrap()
    }

    /// Wait until the receiver's latest trail is terminal.
    pub async fn settled(&self) -> Vec<ReplicaTrail> {
        for _ in 0..100 {
            let trails = self.trails();
            if trails.first().map(|t| t.status.is_terminal()).unwrap_or(false) {
                return trails;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.trails()
    }
}

impl Drop for TargetSide {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}
