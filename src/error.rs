use thiserror::Error;

/// Coarse classification of a failed round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No reply within the retry budget
    Transport,
    /// Unexpected command or inconsistent parent claims from the peer
    Protocol,
    /// Snapshot creation, deletion or lookup failed
    LocalResource,
    /// The `btrfs send` producer failed to start or exited non-zero
    Subprocess,
    /// The supervising process went away
    Orphaned,
    /// Trail bookkeeping failed
    Store,
    /// Bad configuration or task description
    Config,
    /// Another round of the same task holds the lock
    Busy,
}

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Failed to create replica trail for snapshot {snap}: {reason}")]
    TrailCreate { snap: String, reason: String },

    #[error("Failed to update replica trail {trail_id}: {reason}")]
    TrailUpdate { trail_id: u64, reason: String },

    #[error("Failed to prune old snapshot {snap} of share {share}: {reason}")]
    Prune {
        share: String,
        snap: String,
        reason: String,
    },

    #[error("Snapshot {0} already exists; resuming a failed round is not supported")]
    SnapshotExists(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Parent snapshot inconsistency: {0}")]
    ParentInconsistent(String),

    #[error("Receiver {addr} unreachable after {attempts} attempts")]
    UnreachablePeer { addr: String, attempts: u32 },

    #[error("Receiver failed to initialize: {0}")]
    ReceiverInit(String),

    #[error("Receiver error while streaming: {0}")]
    Receiver(String),

    #[error("Unexpected reply '{command}' from receiver: {message}")]
    UnexpectedReply { command: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("btrfs send failed to start: {0}")]
    ProducerInit(String),

    #[error("btrfs send terminated unexpectedly: {0}")]
    ProducerUnexpected(String),

    #[error("btrfs send exited with code {code}: {stderr}")]
    ProducerExit { code: i32, stderr: String },

    #[error("Supervisor process {0} exited; aborting round")]
    Orphaned(u32),

    #[error("Replication task {0} is already running")]
    Busy(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ReplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnreachablePeer { .. } | Self::Transport(_) => ErrorKind::Transport,
            Self::ParentInconsistent(_)
            | Self::ReceiverInit(_)
            | Self::Receiver(_)
            | Self::UnexpectedReply { .. } => ErrorKind::Protocol,
            Self::Prune { .. } | Self::SnapshotExists(_) | Self::Snapshot(_) => {
                ErrorKind::LocalResource
            }
            Self::ProducerInit(_) | Self::ProducerUnexpected(_) | Self::ProducerExit { .. } => {
                ErrorKind::Subprocess
            }
            Self::Orphaned(_) => ErrorKind::Orphaned,
            Self::TrailCreate { .. } | Self::TrailUpdate { .. } => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
            Self::Busy(_) => ErrorKind::Busy,
        }
    }

    /// Process exit code for the `send` command.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Config => 1,
            ErrorKind::Transport => 2,
            ErrorKind::Protocol => 3,
            ErrorKind::LocalResource => 4,
            ErrorKind::Subprocess => 5,
            ErrorKind::Orphaned => 6,
            ErrorKind::Store => 7,
            ErrorKind::Busy => 8,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let errors = [
            ReplicationError::Config("x".into()),
            ReplicationError::UnreachablePeer {
                addr: "10.0.0.2:10002".into(),
                attempts: 10,
            },
            ReplicationError::ParentInconsistent("x".into()),
            ReplicationError::SnapshotExists("x".into()),
            ReplicationError::ProducerExit {
                code: 1,
                stderr: String::new(),
            },
            ReplicationError::Orphaned(1),
            ReplicationError::TrailCreate {
                snap: "x".into(),
                reason: "y".into(),
            },
            ReplicationError::Busy("x".into()),
        ];

        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_unreachable_message_mentions_peer() {
        let err = ReplicationError::UnreachablePeer {
            addr: "10.0.0.2:10002".into(),
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("unreachable"));
        assert!(msg.contains("10.0.0.2"));
    }
}
