//! Sender side of a replication round.
//!
//! One [`Sender`] drives one round for one task: greet the receiver, record a
//! pending trail, prune old snapshots, pick the incremental parent, snapshot
//! the share, wait for the receiver, stream `btrfs send` output, and finalize
//! the trail. Every fatal path comes back as a [`ReplicationError`]; the
//! terminal handler decides what the receiver is told and what the trail
//! records.

use crate::error::{ReplicationError, Result};
use crate::snapshot::{Share, SnapshotManager};
use crate::streaming::channel::{
    RoundStats, DATA_CHUNK_SIZE, HANDSHAKE_POLL, MAX_SEND_ATTEMPTS, PRODUCER_POLL,
    PROGRESS_INTERVAL, REPLY_TIMEOUT,
};
use crate::streaming::producer::{StreamPoll, StreamProducer};
use crate::streaming::protocol::{Command, Frame, SenderReady};
use crate::supervisor::ParentWatch;
use crate::task::{ReplicationTask, REPLICATION_PATTERN};
use crate::trail::{ReplicaTrail, TaskLock, TrailStore, TrailUpdate};
use crate::transport::Transport;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Upper bound on deletions in one pruning pass
const MAX_PRUNE_PER_ROUND: usize = 1024;

/// Sender configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub appliance_uuid: String,
    /// Handshake polls before the receiver is declared unreachable
    pub max_send_attempts: u32,
    /// Wait per handshake poll
    pub handshake_poll: Duration,
    /// Wait per producer stdout poll
    pub producer_poll: Duration,
    /// Max bytes per data frame
    pub chunk_size: usize,
}

impl SenderConfig {
    pub fn new(appliance_uuid: impl Into<String>) -> Self {
        Self {
            appliance_uuid: appliance_uuid.into(),
            max_send_attempts: MAX_SEND_ATTEMPTS,
            handshake_poll: HANDSHAKE_POLL,
            producer_poll: PRODUCER_POLL,
            chunk_size: DATA_CHUNK_SIZE,
        }
    }
}

/// External collaborators a round works through.
#[derive(Clone)]
pub struct Facade {
    pub snapshots: Arc<dyn SnapshotManager>,
    pub trails: Arc<dyn TrailStore>,
    pub producer: Arc<dyn StreamProducer>,
}

/// How a successful round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The stream was sent and the receiver applied it
    Sent {
        bytes: u64,
        kb_sent: u64,
        parent: Option<String>,
    },
    /// The receiver already holds the snapshot
    AlreadyPresent,
}

/// The snapshot an incremental send is computed against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parent {
    pub name: String,
    pub path: PathBuf,
}

/// What the receiver answered to the greeting
#[derive(Debug, Clone, PartialEq, Eq)]
enum Handshake {
    Ready { latest: String },
    SnapExists,
}

/// State carried between the steps of one round
#[derive(Debug, Clone)]
pub struct RoundContext {
    pub identity: String,
    pub share: Share,
    pub snap_name: String,
    pub snap_path: PathBuf,
    /// Whether the greeting announced an incremental send
    pub incremental: bool,
    pub trail_id: Option<u64>,
    pub parent: Option<Parent>,
    pub stats: RoundStats,
}

pub struct Sender<T: Transport> {
    config: SenderConfig,
    task: ReplicationTask,
    prior: Option<ReplicaTrail>,
    facade: Facade,
    transport: T,
    watch: ParentWatch,
    lock_dir: Option<PathBuf>,
}

impl<T: Transport> Sender<T> {
    pub fn new(
        config: SenderConfig,
        task: ReplicationTask,
        prior: Option<ReplicaTrail>,
        facade: Facade,
        transport: T,
    ) -> Self {
        Self {
            config,
            task,
            prior,
            facade,
            transport,
            watch: ParentWatch::current(),
            lock_dir: None,
        }
    }

    pub fn with_parent_watch(mut self, watch: ParentWatch) -> Self {
        self.watch = watch;
        self
    }

    /// Hold the task's lock under `state_dir` for the whole round. A round
    /// started while another holds it fails with [`ReplicationError::Busy`]
    /// before touching trails or snapshots.
    pub fn with_task_lock(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(state_dir.into());
        self
    }

    pub fn identity(&self) -> String {
        self.task.identity(&self.config.appliance_uuid)
    }

    /// Run one round to its terminal state.
    pub async fn run(&mut self) -> Result<RoundOutcome> {
        let _lock = self.lock_task()?;
        let mut ctx = self.new_context()?;
        info!(
            "Starting replication round {} of {}/{} to {} ({})",
            ctx.snap_name,
            ctx.share.pool,
            ctx.share.name,
            self.transport.peer(),
            if ctx.incremental { "incremental" } else { "full" }
        );

        let result = self.drive(&mut ctx).await;
        self.finalize(&ctx, result).await
    }

    fn lock_task(&self) -> Result<Option<TaskLock>> {
        let Some(dir) = &self.lock_dir else {
            return Ok(None);
        };
        let identity = self.identity();
        match TaskLock::try_acquire(dir, &identity) {
            Ok(Some(lock)) => Ok(Some(lock)),
            Ok(None) => {
                warn!("A round of {} is already running", identity);
                Err(ReplicationError::Busy(identity))
            }
            Err(e) => Err(ReplicationError::Config(format!("{:#}", e))),
        }
    }

    fn new_context(&self) -> Result<RoundContext> {
        let identity = self.identity();
        let history = self
            .facade
            .trails
            .list_trails(&identity)
            .map_err(|e| ReplicationError::TrailCreate {
                snap: String::new(),
                reason: format!("{:#}", e),
            })?;
        let share = Share::new(&self.task.pool, &self.task.share);
        let snap_name = self.task.snapshot_name(self.task.next_sequence(&history));
        let snap_path = self.facade.snapshots.snapshot_path(&share, &snap_name);

        Ok(RoundContext {
            identity,
            share,
            snap_name,
            snap_path,
            incremental: self.prior.is_some(),
            trail_id: None,
            parent: None,
            stats: RoundStats::new(),
        })
    }

    async fn drive(&mut self, ctx: &mut RoundContext) -> Result<RoundOutcome> {
        let mut connected = self.greet(ctx).await;

        ctx.trail_id = Some(self.create_trail(ctx)?);

        self.prune(ctx).await?;

        if ctx.incremental {
            ctx.parent = self.resolve_parent(ctx, None).await?;
            if ctx.parent.is_none() {
                warn!(
                    "No usable parent snapshot for {}; falling back to a full send",
                    ctx.snap_name
                );
            }
        }

        self.create_snapshot(ctx).await?;

        match self.await_receiver(ctx, &mut connected).await? {
            Handshake::SnapExists => {
                info!(
                    "Receiver already has {}; nothing to send",
                    ctx.snap_name
                );
                return Ok(RoundOutcome::AlreadyPresent);
            }
            Handshake::Ready { latest } => {
                if ctx.incremental {
                    ctx.parent = self.resolve_parent(ctx, Some(&latest)).await?;
                }
            }
        }

        self.stream(ctx).await
    }

    // =========================================================================
    // Greeting
    // =========================================================================

    /// Open the connection and send `sender-ready`. Returns whether the
    /// greeting went out; failures are retried by the handshake loop.
    async fn greet(&mut self, ctx: &RoundContext) -> bool {
        let ready = SenderReady {
            pool: self.task.dest_pool.clone(),
            share: self
                .task
                .dest_share
                .clone()
                .unwrap_or_else(|| self.task.share.clone()),
            snap: ctx.snap_name.clone(),
            incremental: ctx.incremental,
            uuid: ctx.identity.clone(),
        };

        let transport = &mut self.transport;
        let greeting = async {
            let frame = ready.to_frame()?;
            transport.open().await?;
            transport.send(frame.command, frame.payload, true).await?;
            anyhow::Ok(())
        };
        let sent = greeting.await;

        match sent {
            Ok(()) => {
                debug!("Sent sender-ready for {}", ctx.snap_name);
                true
            }
            Err(e) => {
                warn!("Failed to greet receiver {}: {:#}", self.transport.peer(), e);
                false
            }
        }
    }

    // =========================================================================
    // Trail bookkeeping
    // =========================================================================

    fn create_trail(&self, ctx: &RoundContext) -> Result<u64> {
        let id = self
            .facade
            .trails
            .create_replica_trail(&ctx.identity, &ctx.snap_name)
            .map_err(|e| ReplicationError::TrailCreate {
                snap: ctx.snap_name.clone(),
                reason: format!("{:#}", e),
            })?;
        debug!("Created replica trail {} for {}", id, ctx.snap_name);
        Ok(id)
    }

    /// Non-terminal trail updates are informational; a failure is logged only.
    fn note_trail(&self, ctx: &RoundContext, update: TrailUpdate) {
        if let Some(id) = ctx.trail_id {
            if let Err(e) = self.facade.trails.update_replica_status(id, update) {
                warn!("Failed to update replica trail {}: {:#}", id, e);
            }
        }
    }

    // =========================================================================
    // Pruning
    // =========================================================================

    /// Delete replication snapshots beyond the retention count, oldest first.
    async fn prune(&self, ctx: &RoundContext) -> Result<()> {
        let snapshots = &self.facade.snapshots;
        let retain = self.task.max_snap_retain;

        for _ in 0..MAX_PRUNE_PER_ROUND {
            let oldest = snapshots
                .oldest_prunable_snapshot(&ctx.share, retain, REPLICATION_PATTERN)
                .await
                .map_err(|e| ReplicationError::Prune {
                    share: ctx.share.name.clone(),
                    snap: String::from("<lookup>"),
                    reason: format!("{:#}", e),
                })?;
            let Some(name) = oldest else {
                return Ok(());
            };

            match snapshots.delete_snapshot(&ctx.share, &name).await {
                Ok(true) => info!("Pruned old replication snapshot {}", name),
                Ok(false) => {
                    return Err(ReplicationError::Prune {
                        share: ctx.share.name.clone(),
                        snap: name,
                        reason: "listed as prunable but not present".to_string(),
                    })
                }
                Err(e) => {
                    return Err(ReplicationError::Prune {
                        share: ctx.share.name.clone(),
                        snap: name,
                        reason: format!("{:#}", e),
                    })
                }
            }
        }

        Err(ReplicationError::Prune {
            share: ctx.share.name.clone(),
            snap: String::from("<many>"),
            reason: format!("still over retention after {} deletions", MAX_PRUNE_PER_ROUND),
        })
    }

    // =========================================================================
    // Parent resolution
    // =========================================================================

    /// Decide the incremental parent.
    ///
    /// `peer_latest` is the receiver's view: `None` before it has answered,
    /// `Some("")` when it has no usable parent. The receiver's choice wins
    /// over the local assumption in `ctx.parent`.
    pub async fn resolve_parent(
        &self,
        ctx: &RoundContext,
        peer_latest: Option<&str>,
    ) -> Result<Option<Parent>> {
        let succeeded = self
            .facade
            .trails
            .list_succeeded_trails(&ctx.identity)
            .map_err(|e| ReplicationError::Snapshot(format!("Failed to list trails: {:#}", e)))?;

        let Some(latest) = peer_latest else {
            for trail in &succeeded {
                let path = self.parent_path(ctx, &trail.snap_name);
                if self.facade.snapshots.snapshot_exists(&path).await {
                    return Ok(Some(Parent {
                        name: trail.snap_name.clone(),
                        path,
                    }));
                }
                debug!("Previous snapshot {} no longer exists", trail.snap_name);
            }
            return Ok(None);
        };

        if latest.is_empty() {
            info!("Receiver has no usable parent; sending {} in full", ctx.snap_name);
            return Ok(None);
        }

        if let Some(assumed) = ctx.parent.as_ref().filter(|p| p.name == latest) {
            if self.facade.snapshots.snapshot_exists(&assumed.path).await {
                return Ok(Some(assumed.clone()));
            }
            return Err(ReplicationError::ParentInconsistent(format!(
                "receiver expects parent {} but it no longer exists locally at {}",
                latest,
                assumed.path.display()
            )));
        }

        info!(
            "Receiver reports {} as latest snapshot (local assumption: {}); using receiver's choice",
            latest,
            ctx.parent.as_ref().map(|p| p.name.as_str()).unwrap_or("none")
        );
        let Some(trail) = succeeded.iter().find(|t| t.snap_name == latest) else {
            return Err(ReplicationError::ParentInconsistent(format!(
                "receiver reports {} but no successful send of it is recorded",
                latest
            )));
        };
        let path = self.parent_path(ctx, &trail.snap_name);
        if !self.facade.snapshots.snapshot_exists(&path).await {
            return Err(ReplicationError::ParentInconsistent(format!(
                "receiver reports {} but it no longer exists locally at {}",
                latest,
                path.display()
            )));
        }
        Ok(Some(Parent {
            name: trail.snap_name.clone(),
            path,
        }))
    }

    fn parent_path(&self, ctx: &RoundContext, name: &str) -> PathBuf {
        self.facade.snapshots.snapshot_path(&ctx.share, name)
    }

    // =========================================================================
    // Snapshot creation
    // =========================================================================

    async fn create_snapshot(&self, ctx: &RoundContext) -> Result<()> {
        let snapshots = &self.facade.snapshots;
        if snapshots.snapshot_exists(&ctx.snap_path).await {
            return Err(ReplicationError::SnapshotExists(ctx.snap_name.clone()));
        }
        snapshots
            .create_snapshot(&ctx.share, &ctx.snap_name)
            .await
            .map_err(|e| ReplicationError::Snapshot(format!("{:#}", e)))?;
        info!("Created snapshot {}", ctx.snap_path.display());
        self.note_trail(ctx, TrailUpdate::SnapshotCreated);
        Ok(())
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn await_receiver(
        &mut self,
        ctx: &RoundContext,
        connected: &mut bool,
    ) -> Result<Handshake> {
        let max = self.config.max_send_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            if self.watch.is_orphaned() {
                return Err(ReplicationError::Orphaned(self.watch.pid().unwrap_or(0)));
            }

            let polled = if *connected {
                self.transport.poll(self.config.handshake_poll).await
            } else {
                tokio::time::sleep(self.config.handshake_poll).await;
                Ok(None)
            };

            match polled {
                Ok(Some(frame)) => return Self::handshake_reply(frame),
                Ok(None) => {}
                Err(e) => debug!("Handshake poll failed: {:#}", e),
            }

            attempts += 1;
            self.transport.close().await;
            if attempts >= max {
                return Err(ReplicationError::UnreachablePeer {
                    addr: self.transport.peer().to_string(),
                    attempts,
                });
            }
            warn!(
                "Receiver {} silent ({}/{}); reconnecting",
                self.transport.peer(),
                attempts,
                max
            );
            *connected = self.greet(ctx).await;
        }
    }

    fn handshake_reply(frame: Frame) -> Result<Handshake> {
        match &frame.command {
            Command::ReceiverReady => Ok(Handshake::Ready {
                latest: frame.message(),
            }),
            Command::SnapExists => Ok(Handshake::SnapExists),
            Command::ReceiverInitError => Err(ReplicationError::ReceiverInit(frame.message())),
            other => Err(ReplicationError::UnexpectedReply {
                command: other.to_string(),
                message: frame.message(),
            }),
        }
    }

    // =========================================================================
    // Streaming
    // =========================================================================

    async fn stream(&mut self, ctx: &mut RoundContext) -> Result<RoundOutcome> {
        let parent_path = ctx.parent.as_ref().map(|p| p.path.clone());
        let mut producer = self
            .facade
            .producer
            .spawn(&ctx.snap_path, parent_path.as_deref())
            .map_err(|e| ReplicationError::ProducerInit(e.to_string()))?
            .with_chunk_size(self.config.chunk_size);

        match &ctx.parent {
            Some(p) => info!("Sending {} incrementally from {}", ctx.snap_name, p.name),
            None => info!("Sending {} in full", ctx.snap_name),
        }
        self.note_trail(ctx, TrailUpdate::SendStarted);

        let mut exit = None;
        let mut next_progress = PROGRESS_INTERVAL;

        loop {
            if self.watch.is_orphaned() {
                producer.kill().await;
                return Err(ReplicationError::Orphaned(self.watch.pid().unwrap_or(0)));
            }

            if exit.is_none() {
                exit = producer
                    .try_exit()
                    .map_err(|e| ReplicationError::ProducerUnexpected(e.to_string()))?;
                if let Some(status) = exit {
                    debug!("btrfs send exited with {}", status);
                }
            }

            let chunk = match producer.poll_chunk(self.config.producer_poll).await {
                Ok(StreamPoll::Data(chunk)) => chunk,
                Ok(StreamPoll::Idle) => continue,
                Ok(StreamPoll::Eof) => break,
                Err(e) => {
                    producer.kill().await;
                    return Err(ReplicationError::ProducerUnexpected(e.to_string()));
                }
            };

            let len = chunk.len();
            let reply = match self.transport.send(Command::Chunk, chunk, false).await {
                Ok(reply) => reply,
                Err(e) => {
                    producer.kill().await;
                    return Err(ReplicationError::Transport(format!("{:#}", e)));
                }
            };
            match &reply.command {
                Command::ReceiverOk => {}
                Command::ReceiverError => {
                    producer.kill().await;
                    return Err(ReplicationError::Receiver(reply.message()));
                }
                _ if reply.is_empty() => {
                    producer.kill().await;
                    return Err(ReplicationError::Receiver(format!(
                        "no reply after {} bytes",
                        ctx.stats.bytes_sent
                    )));
                }
                other => {
                    producer.kill().await;
                    return Err(ReplicationError::UnexpectedReply {
                        command: other.to_string(),
                        message: reply.message(),
                    });
                }
            }

            ctx.stats.record_chunk(len);
            if ctx.stats.bytes_sent >= next_progress {
                info!("{}: {} kB sent", ctx.snap_name, ctx.stats.kb_sent());
                next_progress += PROGRESS_INTERVAL;
            }
        }

        // Stdout is closed; the exit status settles the round
        let status = match exit {
            Some(status) => status,
            None => match producer.wait_exit(REPLY_TIMEOUT).await {
                Ok(Some(status)) => status,
                Ok(None) => {
                    producer.kill().await;
                    return Err(ReplicationError::ProducerUnexpected(
                        "closed its output but did not exit".to_string(),
                    ));
                }
                Err(e) => return Err(ReplicationError::ProducerUnexpected(e.to_string())),
            },
        };
        let stderr = producer.stderr().await;

        if !status.success() {
            return Err(ReplicationError::ProducerExit {
                code: status.code().unwrap_or(-1),
                stderr,
            });
        }

        let reply = self
            .transport
            .send(Command::BtrfsSendStreamFinished, Bytes::new(), false)
            .await
            .map_err(|e| ReplicationError::Transport(format!("{:#}", e)))?;
        match reply.command {
            Command::ReceiverError => return Err(ReplicationError::Receiver(reply.message())),
            Command::BtrfsRecvFinished => {}
            _ => warn!(
                "Receiver did not confirm {} ({}); recording as sent",
                ctx.snap_name, reply.command
            ),
        }

        Ok(RoundOutcome::Sent {
            bytes: ctx.stats.bytes_sent,
            kb_sent: ctx.stats.kb_sent(),
            parent: ctx.parent.as_ref().map(|p| p.name.clone()),
        })
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// What to tell the receiver about a failed round, if anything.
    fn peer_notice(err: &ReplicationError) -> Option<Frame> {
        match err {
            ReplicationError::ProducerInit(msg) => Some(Frame::new(
                Command::BtrfsSendInitError,
                Bytes::from(msg.clone()),
            )),
            ReplicationError::ProducerUnexpected(msg) => Some(Frame::new(
                Command::BtrfsSendUnexpectedTermination,
                Bytes::from(msg.clone()),
            )),
            ReplicationError::ProducerExit { .. } => {
                Some(Frame::command(Command::BtrfsSendNonzeroTermination))
            }
            _ => None,
        }
    }

    async fn finalize(
        &mut self,
        ctx: &RoundContext,
        result: Result<RoundOutcome>,
    ) -> Result<RoundOutcome> {
        let update = match &result {
            Err(ReplicationError::Orphaned(pid)) => {
                // Nobody left to report to; the trail stays pending
                error!(
                    "Supervisor {} exited; abandoning round {}",
                    pid, ctx.snap_name
                );
                self.transport.close().await;
                return result;
            }
            Err(err) => {
                error!("Replication round {} failed: {}", ctx.snap_name, err);
                if let Some(notice) = Self::peer_notice(err) {
                    if let Err(e) = self
                        .transport
                        .send(notice.command, notice.payload, true)
                        .await
                    {
                        warn!("Failed to notify receiver: {:#}", e);
                    }
                }
                TrailUpdate::Failed {
                    error: err.to_string(),
                }
            }
            Ok(RoundOutcome::AlreadyPresent) => TrailUpdate::Succeeded {
                kb_sent: 0,
                note: Some(format!(
                    "Snapshot {} already exists on the receiver; nothing sent",
                    ctx.snap_name
                )),
            },
            Ok(RoundOutcome::Sent { kb_sent, .. }) => {
                info!("Replication round {} succeeded: {} kB sent", ctx.snap_name, kb_sent);
                TrailUpdate::Succeeded {
                    kb_sent: *kb_sent,
                    note: None,
                }
            }
        };

        self.transport.close().await;

        let Some(trail_id) = ctx.trail_id else {
            return result;
        };
        if let Err(e) = self.facade.trails.update_replica_status(trail_id, update) {
            error!("Failed to finalize replica trail {}: {:#}", trail_id, e);
            if result.is_ok() {
                return Err(ReplicationError::TrailUpdate {
                    trail_id,
                    reason: format!("{:#}", e),
                });
            }
        }
        result
    }
}
