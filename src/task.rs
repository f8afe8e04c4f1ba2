//! Replication task description and snapshot naming.

use crate::trail::ReplicaTrail;
use serde::{Deserialize, Serialize};

/// Marker shared by every snapshot created for replication.
pub const REPLICATION_MARKER: &str = "_replication_";

/// Glob matching replication snapshots, used for retention pruning.
pub const REPLICATION_PATTERN: &str = "*_replication_*";

/// Default port the receiver daemon listens on
pub const DEFAULT_RECEIVER_PORT: u16 = 10002;

fn default_port() -> u16 {
    DEFAULT_RECEIVER_PORT
}

/// One scheduled replication task. Immutable for the lifetime of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub id: u64,
    /// Source share name
    pub share: String,
    /// Pool holding the source share
    pub pool: String,
    /// Destination pool on the receiving appliance
    pub dest_pool: String,
    /// Destination share name on the receiving appliance
    #[serde(default)]
    pub dest_share: Option<String>,
    /// Receiving appliance address (host or IP)
    pub receiver: String,
    #[serde(default = "default_port")]
    pub receiver_port: u16,
    /// Number of replication snapshots kept on the source
    pub max_snap_retain: usize,
}

impl ReplicationTask {
    /// Stable session identity, `{appliance-uuid}-{task-id}`.
    pub fn identity(&self, appliance_uuid: &str) -> String {
        format!("{}-{}", appliance_uuid, self.id)
    }

    pub fn receiver_addr(&self) -> String {
        format!("{}:{}", self.receiver, self.receiver_port)
    }

    /// Name of the snapshot for the given round sequence.
    pub fn snapshot_name(&self, sequence: u64) -> String {
        format!(
            "{}_{}{}{}",
            self.share, self.id, REPLICATION_MARKER, sequence
        )
    }

    /// Sequence for the next round, one past the highest sequence in the
    /// trail history. Failed rounds count too so names are never reused.
    pub fn next_sequence(&self, history: &[ReplicaTrail]) -> u64 {
        history
            .iter()
            .filter_map(|t| parse_sequence(&t.snap_name))
            .max()
            .map(|s| s + 1)
            .unwrap_or(history.len() as u64 + 1)
    }
}

/// Extract the trailing sequence number from a replication snapshot name.
pub fn parse_sequence(snap_name: &str) -> Option<u64> {
    let idx = snap_name.rfind(REPLICATION_MARKER)?;
    snap_name[idx + REPLICATION_MARKER.len()..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trail::TrailStatus;

    fn task() -> ReplicationTask {
        ReplicationTask {
            id: 7,
            share: "media".to_string(),
            pool: "tank".to_string(),
            dest_pool: "backup".to_string(),
            dest_share: None,
            receiver: "10.0.0.2".to_string(),
            receiver_port: DEFAULT_RECEIVER_PORT,
            max_snap_retain: 3,
        }
    }

    fn trail(id: u64, snap: &str, status: TrailStatus) -> ReplicaTrail {
        let mut t = ReplicaTrail::new(id, "uuid-7", snap);
        t.status = status;
        t
    }

    #[test]
    fn test_identity_and_names() {
        let t = task();
        assert_eq!(t.identity("abc"), "abc-7");
        assert_eq!(t.snapshot_name(3), "media_7_replication_3");
        assert_eq!(t.receiver_addr(), "10.0.0.2:10002");
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("media_7_replication_12"), Some(12));
        assert_eq!(parse_sequence("media_7_replication_"), None);
        assert_eq!(parse_sequence("media_snap"), None);
    }

    #[test]
    fn test_next_sequence_counts_failed_rounds() {
        let t = task();
        assert_eq!(t.next_sequence(&[]), 1);

        let history = vec![
            trail(1, "media_7_replication_1", TrailStatus::Succeeded),
            trail(2, "media_7_replication_2", TrailStatus::Failed),
        ];
        assert_eq!(t.next_sequence(&history), 3);
    }

    #[test]
    fn test_task_from_toml() {
        let t: ReplicationTask = toml::from_str(
            r#"
            id = 7
            share = "media"
            pool = "tank"
            dest_pool = "backup"
            receiver = "10.0.0.2"
            max_snap_retain = 3
            "#,
        )
        .unwrap();
        assert_eq!(t, task());
    }
}
