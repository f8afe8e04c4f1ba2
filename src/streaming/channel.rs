//! Shared constants and byte accounting for a replication round.

use std::time::Duration;

/// Maximum bytes forwarded per data frame
pub const DATA_CHUNK_SIZE: usize = 1024 * 1024; // 1MB

/// How long a forwarded frame waits for its reply
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// How long each handshake poll waits for the receiver
pub const HANDSHAKE_POLL: Duration = Duration::from_secs(6);

/// Handshake retry budget
pub const MAX_SEND_ATTEMPTS: u32 = 10;

/// How long one poll of the producer's stdout may wait before reporting
/// "no data yet"
pub const PRODUCER_POLL: Duration = Duration::from_millis(100);

/// Log a progress line every this many bytes
pub const PROGRESS_INTERVAL: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Round statistics
// =============================================================================

/// Statistics for one streaming round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoundStats {
    /// Stream bytes forwarded to the receiver
    pub bytes_sent: u64,

    /// Data frames forwarded
    pub chunks_sent: u64,
}

impl RoundStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.bytes_sent += len as u64;
        self.chunks_sent += 1;
    }

    /// Whole kilobytes sent, as stored on the trail
    pub fn kb_sent(&self) -> u64 {
        self.bytes_sent / 1024
    }
}
