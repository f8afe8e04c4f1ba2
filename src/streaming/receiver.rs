//! Receiver side of a replication round.
//!
//! A [`ReceiverSession`] holds the receive state for one sender identity. The
//! server feeds it frames and writes back whatever reply it returns. At most
//! one receive is in flight per session; a new greeting or a lost connection
//! discards it.

use crate::snapshot::{Share, SnapshotManager};
use crate::streaming::consumer::{ConsumerHandle, StreamConsumer};
use crate::streaming::protocol::{Command, Frame, SenderReady};
use crate::task::REPLICATION_PATTERN;
use crate::trail::{TrailStore, TrailUpdate};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Upper bound on deletions in one retention pass
const MAX_PRUNE_PER_RECEIVE: usize = 1024;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Received replication snapshots kept per destination share
    pub max_snap_retain: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self { max_snap_retain: 5 }
    }
}

/// External collaborators of the receiving side.
#[derive(Clone)]
pub struct ReceiverFacade {
    pub snapshots: Arc<dyn SnapshotManager>,
    pub trails: Arc<dyn TrailStore>,
    pub consumer: Arc<dyn StreamConsumer>,
}

/// A receive in progress
struct ActiveReceive {
    share: Share,
    snap: String,
    trail_id: u64,
    consumer: ConsumerHandle,
}

pub struct ReceiverSession {
    identity: String,
    config: ReceiverConfig,
    facade: ReceiverFacade,
    active: Option<ActiveReceive>,
    /// Bumped whenever a new connection attaches
    generation: u64,
}

impl ReceiverSession {
    pub fn new(identity: impl Into<String>, config: ReceiverConfig, facade: ReceiverFacade) -> Self {
        Self {
            identity: identity.into(),
            config,
            facade,
            active: None,
            generation: 0,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_receiving(&self) -> bool {
        self.active.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Attach a new connection. Any receive started over the previous one is
    /// discarded. Returns the new generation.
    pub async fn attach(&mut self) -> u64 {
        self.abort("superseded by a new connection").await;
        self.generation += 1;
        self.generation
    }

    /// Handle one frame; `Some` is the reply to write back.
    pub async fn handle(&mut self, frame: Frame) -> Option<Frame> {
        match &frame.command {
            Command::SenderReady => Some(self.on_sender_ready(&frame.payload).await),
            Command::Chunk => Some(self.on_chunk(&frame.payload).await),
            Command::BtrfsSendStreamFinished => Some(self.on_stream_finished().await),
            cmd if cmd.is_send_failure() => {
                let reason = format!("sender reported {}: {}", cmd, frame.message());
                warn!("{}: {}", self.identity, reason);
                self.abort(&reason).await;
                None
            }
            Command::Hello => {
                debug!("{}: ignoring repeated hello", self.identity);
                None
            }
            other => {
                warn!("{}: unexpected command {}", self.identity, other);
                Some(Frame::new(
                    Command::ReceiverError,
                    Bytes::from(format!("unexpected command {}", other)),
                ))
            }
        }
    }

    /// Discard the receive in progress, if any, and record why.
    pub async fn abort(&mut self, reason: &str) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.consumer.abort().await;
        self.discard(&active.share, &active.snap, active.trail_id, reason)
            .await;
    }

    // =========================================================================
    // sender-ready
    // =========================================================================

    async fn on_sender_ready(&mut self, payload: &[u8]) -> Frame {
        self.abort("superseded by a new greeting").await;

        let ready = match SenderReady::from_payload(payload) {
            Ok(ready) => ready,
            Err(e) => return init_error(format!("{:#}", e)),
        };
        if ready.uuid != self.identity {
            warn!(
                "{}: greeting names identity {}; trails stay keyed by the connection",
                self.identity, ready.uuid
            );
        }

        match self.start(&ready).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("{}: cannot receive {}: {:#}", self.identity, ready.snap, e);
                init_error(format!("{:#}", e))
            }
        }
    }

    async fn start(&mut self, ready: &SenderReady) -> Result<Frame> {
        let snapshots = &self.facade.snapshots;
        let pool_dir = snapshots.pool_path(&ready.pool);
        let meta = tokio::fs::metadata(&pool_dir)
            .await
            .with_context(|| format!("Pool {} not found at {}", ready.pool, pool_dir.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("Pool path {} is not a directory", pool_dir.display());
        }
        if meta.permissions().readonly() {
            anyhow::bail!("Pool {} is not writable", ready.pool);
        }

        let share = Share::new(&ready.pool, &ready.share);
        let snap_path = snapshots.snapshot_path(&share, &ready.snap);
        if snapshots.snapshot_exists(&snap_path).await {
            info!("{}: {} already present", self.identity, ready.snap);
            return Ok(Frame::command(Command::SnapExists));
        }

        let dest_dir = snapshots.snapshot_dir(&share);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

        let parent = if ready.incremental {
            self.latest_received(&share).await?
        } else {
            None
        };

        let trail_id = self
            .facade
            .trails
            .create_replica_trail(&self.identity, &ready.snap)
            .context("Failed to record receive")?;

        let consumer = match self.facade.consumer.spawn(&dest_dir, &ready.snap) {
            Ok(consumer) => consumer,
            Err(e) => {
                let reason = format!("Failed to start btrfs receive: {}", e);
                self.finish_trail(trail_id, TrailUpdate::Failed { error: reason.clone() });
                anyhow::bail!(reason);
            }
        };

        info!(
            "{}: receiving {} into {} ({})",
            self.identity,
            ready.snap,
            dest_dir.display(),
            match &parent {
                Some(p) => format!("incremental from {}", p),
                None => "full".to_string(),
            }
        );
        self.active = Some(ActiveReceive {
            share,
            snap: ready.snap.clone(),
            trail_id,
            consumer,
        });
        Ok(Frame::new(
            Command::ReceiverReady,
            Bytes::from(parent.unwrap_or_default()),
        ))
    }

    /// Latest successfully received snapshot that still exists.
    async fn latest_received(&self, share: &Share) -> Result<Option<String>> {
        let received = self.facade.trails.list_succeeded_trails(&self.identity)?;
        for trail in received {
            let path = self.facade.snapshots.snapshot_path(share, &trail.snap_name);
            if self.facade.snapshots.snapshot_exists(&path).await {
                return Ok(Some(trail.snap_name));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Data
    // =========================================================================

    async fn on_chunk(&mut self, data: &[u8]) -> Frame {
        let Some(active) = self.active.as_mut() else {
            return receiver_error("no receive in progress".to_string());
        };
        match active.consumer.write(data).await {
            Ok(()) => Frame::command(Command::ReceiverOk),
            Err(e) => {
                let reason = format!("{:#}", e);
                self.abort(&reason).await;
                receiver_error(reason)
            }
        }
    }

    async fn on_stream_finished(&mut self) -> Frame {
        let Some(active) = self.active.take() else {
            return receiver_error("no receive in progress".to_string());
        };
        let ActiveReceive {
            share,
            snap,
            trail_id,
            consumer,
        } = active;
        let bytes = consumer.bytes_written();

        if let Err(e) = consumer.finish().await {
            let reason = format!("{:#}", e);
            self.discard(&share, &snap, trail_id, &reason).await;
            return receiver_error(reason);
        }

        let path = self.facade.snapshots.snapshot_path(&share, &snap);
        if !self.facade.snapshots.snapshot_exists(&path).await {
            let reason = format!("{} missing after receive", path.display());
            self.finish_trail(trail_id, TrailUpdate::Failed { error: reason.clone() });
            return receiver_error(reason);
        }

        info!("{}: received {} ({} kB)", self.identity, snap, bytes / 1024);
        self.finish_trail(
            trail_id,
            TrailUpdate::Succeeded {
                kb_sent: bytes / 1024,
                note: None,
            },
        );
        self.prune(&share, &snap).await;
        Frame::command(Command::BtrfsRecvFinished)
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Remove a partial snapshot and fail its trail.
    async fn discard(&self, share: &Share, snap: &str, trail_id: u64, reason: &str) {
        match self.facade.snapshots.delete_snapshot(share, snap).await {
            Ok(true) => info!("{}: discarded partial {}", self.identity, snap),
            Ok(false) => {}
            Err(e) => error!(
                "{}: failed to discard partial {}: {:#}",
                self.identity, snap, e
            ),
        }
        self.finish_trail(
            trail_id,
            TrailUpdate::Failed {
                error: reason.to_string(),
            },
        );
    }

    fn finish_trail(&self, trail_id: u64, update: TrailUpdate) {
        if let Err(e) = self.facade.trails.update_replica_status(trail_id, update) {
            error!("{}: failed to update trail {}: {:#}", self.identity, trail_id, e);
        }
    }

    /// Drop received snapshots beyond the retention count. Never fatal.
    async fn prune(&self, share: &Share, keep: &str) {
        let snapshots = &self.facade.snapshots;
        for _ in 0..MAX_PRUNE_PER_RECEIVE {
            let oldest = match snapshots
                .oldest_prunable_snapshot(share, self.config.max_snap_retain, REPLICATION_PATTERN)
                .await
            {
                Ok(Some(name)) if name != keep => name,
                Ok(_) => return,
                Err(e) => {
                    warn!("{}: retention lookup failed: {:#}", self.identity, e);
                    return;
                }
            };
            match snapshots.delete_snapshot(share, &oldest).await {
                Ok(true) => info!("{}: pruned received snapshot {}", self.identity, oldest),
                Ok(false) => return,
                Err(e) => {
                    warn!("{}: failed to prune {}: {:#}", self.identity, oldest, e);
                    return;
                }
            }
        }
    }
}

fn init_error(message: String) -> Frame {
    Frame::new(Command::ReceiverInitError, Bytes::from(message))
}

fn receiver_error(message: String) -> Frame {
    Frame::new(Command::ReceiverError, Bytes::from(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trail::{FileTrailStore, TrailStatus};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    /// Snapshots as plain directories under a scratch root
    struct DirSnapshots {
        root: PathBuf,
    }

    #[async_trait]
    impl SnapshotManager for DirSnapshots {
        fn pool_path(&self, pool: &str) -> PathBuf {
            self.root.join(pool)
        }

        async fn create_snapshot(&self, share: &Share, name: &str) -> AnyResult<()> {
            Ok(std::fs::create_dir_all(self.snapshot_path(share, name))?)
        }

        async fn delete_snapshot(&self, share: &Share, name: &str) -> AnyResult<bool> {
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
        ) -> AnyResult<Option<String>> {
            let pattern = glob::Pattern::new(pattern)?;
            let mut names = Vec::new();
            for entry in std::fs::read_dir(self.snapshot_dir(share))? {
                let name = entry?.file_name().to_string_lossy().into_owned();
                if pattern.matches(&name) {
                    names.push(name);
                }
            }
            if names.len() <= retain {
                return Ok(None);
            }
            names.sort_by_key(|n| crate::task::parse_sequence(n).unwrap_or(0));
            Ok(names.into_iter().next())
        }
    }

    /// `sh -c script consumer <dest_dir> <snap>`
    struct ShConsumer(&'static str);

    impl StreamConsumer for ShConsumer {
        fn spawn(&self, dest_dir: &Path, snap: &str) -> std::io::Result<ConsumerHandle> {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c")
                .arg(self.0)
                .arg("consumer")
                .arg(dest_dir)
                .arg(snap);
            ConsumerHandle::spawn(cmd)
        }
    }

    const RECEIVE: &str = "mkdir \"$1/$2\" && cat > \"$1/$2/stream\"";

    struct Harness {
        tmp: tempfile::TempDir,
        trails: Arc<FileTrailStore>,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(tmp.path().join("pools/backup")).unwrap();
            let trails = Arc::new(FileTrailStore::open(&tmp.path().join("state")).unwrap());
            Self { tmp, trails }
        }

        fn session(&self, consumer: &'static str, retain: usize) -> ReceiverSession {
            let facade = ReceiverFacade {
                snapshots: Arc::new(DirSnapshots {
                    root: self.tmp.path().join("pools"),
                }),
                trails: self.trails.clone(),
                consumer: Arc::new(ShConsumer(consumer)),
            };
            ReceiverSession::new(
                "appliance-7",
                ReceiverConfig {
                    max_snap_retain: retain,
                },
                facade,
            )
        }

        fn snap_dir(&self) -> PathBuf {
            self.tmp.path().join("pools/backup/.snapshots/media")
        }

        fn trails(&self) -> Vec<crate::trail::ReplicaTrail> {
            self.trails.list_trails("appliance-7").unwrap()
        }
    }

    fn greeting(snap: &str, incremental: bool) -> Frame {
        SenderReady {
            pool: "backup".to_string(),
            share: "media".to_string(),
            snap: snap.to_string(),
            incremental,
            uuid: "appliance-7".to_string(),
        }
        .to_frame()
        .unwrap()
    }

    fn chunk(data: &'static [u8]) -> Frame {
        Frame::new(Command::Chunk, Bytes::from_static(data))
    }

    async fn receive(session: &mut ReceiverSession, snap: &str, incremental: bool) -> Frame {
        let ready = session.handle(greeting(snap, incremental)).await.unwrap();
        assert_eq!(ready.command, Command::ReceiverReady);
        let ack = session.handle(chunk(b"stream")).await.unwrap();
        assert_eq!(ack.command, Command::ReceiverOk);
        session
            .handle(Frame::command(Command::BtrfsSendStreamFinished))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_receive() {
        let h = Harness::new();
        let mut session = h.session(RECEIVE, 5);

        let done = receive(&mut session, "media_7_replication_1", false).await;
        assert_eq!(done.command, Command::BtrfsRecvFinished);
        assert!(!session.is_receiving());
        assert_eq!(
            std::fs::read(h.snap_dir().join("media_7_replication_1/stream")).unwrap(),
            b"stream"
        );
        let trails = h.trails();
        assert_eq!(trails[0].status, TrailStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_ready_reports_latest_received_parent() {
        let h = Harness::new();
        let mut session = h.session(RECEIVE, 5);
        receive(&mut session, "media_7_replication_1", false).await;

        let ready = session
            .handle(greeting("media_7_replication_2", true))
            .await
            .unwrap();
        assert_eq!(ready.command, Command::ReceiverReady);
        assert_eq!(ready.message(), "media_7_replication_1");

        // Full sends ignore history
        let ready = session
            .handle(greeting("media_7_replication_2", false))
            .await
            .unwrap();
        assert_eq!(ready.message(), "");
    }

    #[tokio::test]
    async fn test_existing_snapshot_reply() {
        let h = Harness::new();
        std::fs::create_dir_all(h.snap_dir().join("media_7_replication_3")).unwrap();
        let mut session = h.session(RECEIVE, 5);

        let reply = session
            .handle(greeting("media_7_replication_3", true))
            .await
            .unwrap();
        assert_eq!(reply.command, Command::SnapExists);
        assert!(!session.is_receiving());
        assert!(h.trails().is_empty());
    }

    #[tokio::test]
    async fn test_missing_pool_is_init_error() {
        let h = Harness::new();
        let mut session = h.session(RECEIVE, 5);
        let mut ready = SenderReady::from_payload(&greeting("s_1_replication_1", false).payload).unwrap();
        ready.pool = "nowhere".to_string();

        let reply = session.handle(ready.to_frame().unwrap()).await.unwrap();
        assert_eq!(reply.command, Command::ReceiverInitError);
        assert!(reply.message().contains("nowhere"));
    }

    #[tokio::test]
    async fn test_sender_failure_discards_partial() {
        let h = Harness::new();
        let mut session = h.session(RECEIVE, 5);
        session
            .handle(greeting("media_7_replication_1", false))
            .await
            .unwrap();
        session.handle(chunk(b"partial")).await.unwrap();

        let reply = session
            .handle(Frame::new(
                Command::BtrfsSendNonzeroTermination,
                Bytes::from_static(b"ioctl failed"),
            ))
            .await;
        assert!(reply.is_none());
        assert!(!session.is_receiving());
        assert!(!h.snap_dir().join("media_7_replication_1").exists());

        let trail = &h.trails()[0];
        assert_eq!(trail.status, TrailStatus::Failed);
        assert!(trail.error.as_deref().unwrap().contains("ioctl failed"));
    }

    #[tokio::test]
    async fn test_consumer_failure_is_receiver_error() {
        let h = Harness::new();
        let mut session = h.session(
            "mkdir \"$1/$2\"; cat > /dev/null; echo 'ERROR: bad stream' >&2; exit 1",
            5,
        );
        let done = receive(&mut session, "media_7_replication_1", false).await;
        assert_eq!(done.command, Command::ReceiverError);
        assert!(done.message().contains("bad stream"));
        assert!(!h.snap_dir().join("media_7_replication_1").exists());
        assert_eq!(h.trails()[0].status, TrailStatus::Failed);
    }

    #[tokio::test]
    async fn test_chunk_without_receive() {
        let h = Harness::new();
        let mut session = h.session(RECEIVE, 5);
        let reply = session.handle(chunk(b"stray")).await.unwrap();
        assert_eq!(reply.command, Command::ReceiverError);
    }

    #[tokio::test]
    async fn test_reattach_discards_receive() {
        let h = Harness::new();
        let mut session = h.session(RECEIVE, 5);
        let first = session.attach().await;
        session
            .handle(greeting("media_7_replication_1", false))
            .await
            .unwrap();
        assert!(session.is_receiving());

        let second = session.attach().await;
        assert!(second > first);
        assert!(!session.is_receiving());
        assert_eq!(h.trails()[0].status, TrailStatus::Failed);
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest_received() {
        let h = Harness::new();
        let mut session = h.session(RECEIVE, 2);
        for i in 1..=4 {
            let done = receive(&mut session, &format!("media_7_replication_{}", i), i > 1).await;
            assert_eq!(done.command, Command::BtrfsRecvFinished);
        }

        let mut left: Vec<String> = std::fs::read_dir(h.snap_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["media_7_replication_3", "media_7_replication_4"]);
    }
}
