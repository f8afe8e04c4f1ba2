//! snaprep - btrfs snapshot replication between appliances.
//!
//! A [`streaming::Sender`] runs one replication round for a task: it snapshots
//! the source share and streams it, full or incremental, to a
//! [`server::ReceiverServer`] on the destination appliance. Every round leaves
//! a [`trail::ReplicaTrail`] behind.

pub mod config;
pub mod error;
pub mod server;
pub mod snapshot;
pub mod streaming;
pub mod supervisor;
pub mod task;
pub mod trail;
pub mod transport;

pub use error::{ErrorKind, ReplicationError, Result};
pub use task::ReplicationTask;
