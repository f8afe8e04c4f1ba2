//! Replication trail records: one per attempted round.
//!
//! Trails are the durable history operators see. A trail is created pending at
//! the start of a round and reaches exactly one terminal status at its end.

mod lock;
mod store;

pub use lock::TaskLock;
pub use store::FileTrailStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrailStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TrailStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrailStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaTrail {
    pub id: u64,
    /// Task key the trail belongs to (the replication identity)
    pub task: String,
    pub snap_name: String,
    pub status: TrailStatus,
    pub error: Option<String>,
    pub kb_sent: u64,
    pub created: DateTime<Utc>,
    pub snapshot_created: Option<DateTime<Utc>>,
    pub send_started: Option<DateTime<Utc>>,
    pub send_succeeded: Option<DateTime<Utc>>,
    pub send_failed: Option<DateTime<Utc>>,
}

impl ReplicaTrail {
    pub fn new(id: u64, task: impl Into<String>, snap_name: impl Into<String>) -> Self {
        Self {
            id,
            task: task.into(),
            snap_name: snap_name.into(),
            status: TrailStatus::Pending,
            error: None,
            kb_sent: 0,
            created: Utc::now(),
            snapshot_created: None,
            send_started: None,
            send_succeeded: None,
            send_failed: None,
        }
    }

    /// Apply an update, refusing a second terminal transition.
    pub fn apply(&mut self, update: &TrailUpdate) -> Result<()> {
        let now = Utc::now();
        if self.status.is_terminal() && update.is_terminal() {
            anyhow::bail!(
                "Trail {} already finalized as {:?}",
                self.id,
                self.status
            );
        }
        match update {
            TrailUpdate::SnapshotCreated => self.snapshot_created = Some(now),
            TrailUpdate::SendStarted => self.send_started = Some(now),
            TrailUpdate::Succeeded { kb_sent, note } => {
                self.status = TrailStatus::Succeeded;
                self.kb_sent = *kb_sent;
                self.error = note.clone();
                self.send_succeeded = Some(now);
            }
            TrailUpdate::Failed { error } => {
                self.status = TrailStatus::Failed;
                self.error = Some(error.clone());
                self.send_failed = Some(now);
            }
        }
        Ok(())
    }
}

/// A mutation of a pending trail.
#[derive(Debug, Clone, PartialEq)]
pub enum TrailUpdate {
    SnapshotCreated,
    SendStarted,
    Succeeded { kb_sent: u64, note: Option<String> },
    Failed { error: String },
}

impl TrailUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrailUpdate::Succeeded { .. } | TrailUpdate::Failed { .. })
    }
}

/// Persistence facade for trail records.
pub trait TrailStore: Send + Sync {
    /// Create a pending trail and return its id.
    fn create_replica_trail(&self, task: &str, snap_name: &str) -> Result<u64>;

    fn update_replica_status(&self, trail_id: u64, update: TrailUpdate) -> Result<()>;

    /// All trails of a task, most recent first.
    fn list_trails(&self, task: &str) -> Result<Vec<ReplicaTrail>>;

    /// Succeeded trails of a task, most recent first.
    fn list_succeeded_trails(&self, task: &str) -> Result<Vec<ReplicaTrail>> {
        Ok(self
            .list_trails(task)?
            .into_iter()
            .filter(|t| t.status == TrailStatus::Succeeded)
            .collect())
    }
}
