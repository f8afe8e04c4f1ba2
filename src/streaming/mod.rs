//! Snapshot streaming between appliances.
//!
//! ```text
//! Sender appliance                          Receiver appliance
//! +--------------+   +--------+   frames   +----------+   +---------------+
//! | btrfs send   |-->| Sender |----------->| Receiver |-->| btrfs receive |
//! | (producer)   |   |        |<-----------| session  |   | (consumer)    |
//! +--------------+   +--------+   replies  +----------+   +---------------+
//! ```
//!
//! The sender greets, waits for `receiver-ready` or `snap-exists`, then
//! forwards producer output one chunk per frame, each acknowledged before the
//! next. `btrfs-send-stream-finished` closes a good stream; the
//! `btrfs-send-*-error` commands tell the receiver to throw a partial one away.

pub mod channel;
pub mod consumer;
pub mod producer;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{RoundStats, DATA_CHUNK_SIZE, HANDSHAKE_POLL, MAX_SEND_ATTEMPTS, REPLY_TIMEOUT};
pub use consumer::{BtrfsReceive, ConsumerHandle, StreamConsumer};
pub use producer::{BtrfsSend, ProducerHandle, StreamPoll, StreamProducer};
pub use protocol::{Command, Frame, Hello, SenderReady, PROTOCOL_VERSION};
pub use receiver::{ReceiverConfig, ReceiverFacade, ReceiverSession};
pub use sender::{Facade, Parent, RoundContext, RoundOutcome, Sender, SenderConfig};
