//! Replication wire protocol.
//!
//! Every exchange is a `(command, payload)` frame. Commands are short ASCII
//! tokens; payloads are opaque bytes (JSON for `sender-ready`, raw
//! `btrfs send` output for stream chunks, diagnostic text for errors).

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version carried in the connection preamble
pub const PROTOCOL_VERSION: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Frame format: len:u32 | cmd_len:u8 | cmd | payload
/// where len covers everything after the length prefix.

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connection preamble carrying version and identity
    Hello,

    // sender -> receiver
    SenderReady,
    /// Stream chunk; the empty token
    Chunk,
    BtrfsSendInitError,
    BtrfsSendUnexpectedTermination,
    BtrfsSendNonzeroTermination,
    BtrfsSendStreamFinished,

    // receiver -> sender
    ReceiverReady,
    ReceiverOk,
    SnapExists,
    ReceiverInitError,
    ReceiverError,
    BtrfsRecvFinished,

    /// Anything this side doesn't know
    Other(String),
}

impl Command {
    pub fn token(&self) -> &str {
        match self {
            Self::Hello => "hello",
            Self::SenderReady => "sender-ready",
            Self::Chunk => "",
            Self::BtrfsSendInitError => "btrfs-send-init-error",
            Self::BtrfsSendUnexpectedTermination => "btrfs-send-unexpected-termination-error",
            Self::BtrfsSendNonzeroTermination => "btrfs-send-nonzero-termination-error",
            Self::BtrfsSendStreamFinished => "btrfs-send-stream-finished",
            Self::ReceiverReady => "receiver-ready",
            Self::ReceiverOk => "receiver-ok",
            Self::SnapExists => "snap-exists",
            Self::ReceiverInitError => "receiver-init-error",
            Self::ReceiverError => "receiver-error",
            Self::BtrfsRecvFinished => "btrfs-recv-finished",
            Self::Other(s) => s,
        }
    }

    pub fn from_token(token: &str) -> Self {
        match token {
            "hello" => Self::Hello,
            "sender-ready" => Self::SenderReady,
            "" => Self::Chunk,
            "btrfs-send-init-error" => Self::BtrfsSendInitError,
            "btrfs-send-unexpected-termination-error" => Self::BtrfsSendUnexpectedTermination,
            "btrfs-send-nonzero-termination-error" => Self::BtrfsSendNonzeroTermination,
            "btrfs-send-stream-finished" => Self::BtrfsSendStreamFinished,
            "receiver-ready" => Self::ReceiverReady,
            "receiver-ok" => Self::ReceiverOk,
            "snap-exists" => Self::SnapExists,
            "receiver-init-error" => Self::ReceiverInitError,
            "receiver-error" => Self::ReceiverError,
            "btrfs-recv-finished" => Self::BtrfsRecvFinished,
            other => Self::Other(other.to_string()),
        }
    }

    /// Sender notifications telling the receiver to discard a partial receive.
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            Self::BtrfsSendInitError
                | Self::BtrfsSendUnexpectedTermination
                | Self::BtrfsSendNonzeroTermination
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chunk => write!(f, "<chunk>"),
            other => write!(f, "{}", other.token()),
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn command(command: Command) -> Self {
        Self::new(command, Bytes::new())
    }

    /// Empty command and payload. Returned by the transport when no reply
    /// arrived in time.
    pub fn empty() -> Self {
        Self::command(Command::Chunk)
    }

    pub fn is_empty(&self) -> bool {
        self.command == Command::Chunk && self.payload.is_empty()
    }

    /// Payload as text, for diagnostics
    pub fn message(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self) -> Bytes {
        let token = self.command.token().as_bytes();
        let len = 1 + token.len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(len as u32);
        buf.put_u8(token.len() as u8);
        buf.put_slice(token);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame body (everything after the length prefix).
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if body.remaining() < 1 {
            anyhow::bail!("Frame too short");
        }
        let token_len = body.get_u8() as usize;
        if body.remaining() < token_len {
            anyhow::bail!(
                "Frame command truncated: expected {} bytes, got {}",
                token_len,
                body.remaining()
            );
        }
        let token = body.split_to(token_len);
        let token = std::str::from_utf8(&token).context("Invalid UTF-8 in frame command")?;
        Ok(Self {
            command: Command::from_token(token),
            payload: body,
        })
    }
}

// =============================================================================
// HELLO (connection preamble)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub version: u16,
    pub identity: String,
}

impl Hello {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            identity: identity.into(),
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(2 + self.identity.len());
        buf.put_u16(self.version);
        buf.put_slice(self.identity.as_bytes());
        Frame::new(Command::Hello, buf.freeze())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.command != Command::Hello {
            anyhow::bail!("Expected hello, got {}", frame.command);
        }
        let mut payload = frame.payload.clone();
        if payload.remaining() < 2 {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u16();
        let identity =
            String::from_utf8(payload.to_vec()).context("Invalid UTF-8 in hello identity")?;
        if identity.is_empty() {
            anyhow::bail!("Hello carries an empty identity");
        }
        Ok(Self { version, identity })
    }
}

// =============================================================================
// SENDER-READY payload
// =============================================================================

/// Greeting payload describing the round the sender is about to stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderReady {
    /// Destination pool
    pub pool: String,
    /// Destination share name
    pub share: String,
    /// Snapshot being sent
    pub snap: String,
    pub incremental: bool,
    /// Sender identity
    pub uuid: String,
}

impl SenderReady {
    pub fn to_frame(&self) -> Result<Frame> {
        let payload = serde_json::to_vec(self).context("Failed to encode sender-ready")?;
        Ok(Frame::new(Command::SenderReady, payload))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("Malformed sender-ready payload")
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)
        .await
        .context("Failed to read frame body")?;

    Frame::decode(Bytes::from(body))
}

/// Write a frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    w.write_all(&frame.encode())
        .await
        .context("Failed to write frame")?;
    w.flush().await.context("Failed to flush frame")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tokens() {
        let all = [
            Command::Hello,
            Command::SenderReady,
            Command::Chunk,
            Command::BtrfsSendInitError,
            Command::BtrfsSendUnexpectedTermination,
            Command::BtrfsSendNonzeroTermination,
            Command::BtrfsSendStreamFinished,
            Command::ReceiverReady,
            Command::ReceiverOk,
            Command::SnapExists,
            Command::ReceiverInitError,
            Command::ReceiverError,
            Command::BtrfsRecvFinished,
        ];
        for cmd in all {
            assert_eq!(Command::from_token(cmd.token()), cmd);
        }
        assert_eq!(
            Command::from_token("bogus"),
            Command::Other("bogus".to_string())
        );
        assert_eq!(Command::Chunk.token(), "");
    }

    #[test]
    fn test_frame_layout() {
        let frame = Frame::new(Command::SnapExists, Bytes::from_static(b"x"));
        let encoded = frame.encode();
        // len(4) + cmd_len(1) + "snap-exists"(11) + payload(1)
        assert_eq!(encoded.len(), 17);
        assert_eq!(&encoded[..4], &13u32.to_be_bytes());
        assert_eq!(encoded[4], 11);

        let decoded = Frame::decode(encoded.slice(4..)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_frame() {
        let empty = Frame::empty();
        assert!(empty.is_empty());
        assert!(!Frame::new(Command::Chunk, Bytes::from_static(b"data")).is_empty());
        assert!(!Frame::command(Command::ReceiverOk).is_empty());
    }

    #[test]
    fn test_decode_truncated_command() {
        let body = Bytes::from_static(&[20, b'a', b'b']);
        assert!(Frame::decode(body).is_err());
        assert!(Frame::decode(Bytes::new()).is_err());
    }

    #[test]
    fn test_hello_preamble() {
        let hello = Hello::new("abc-7");
        let parsed = Hello::from_frame(&hello.to_frame()).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.identity, "abc-7");

        assert!(Hello::from_frame(&Frame::command(Command::SenderReady)).is_err());
        let anonymous = Frame::new(Command::Hello, Bytes::from_static(&[0, 1]));
        assert!(Hello::from_frame(&anonymous).is_err());
    }

    #[test]
    fn test_sender_ready_json() {
        let ready = SenderReady {
            pool: "backup".to_string(),
            share: "media".to_string(),
            snap: "media_7_replication_3".to_string(),
            incremental: true,
            uuid: "abc-7".to_string(),
        };
        let frame = ready.to_frame().unwrap();
        assert_eq!(frame.command, Command::SenderReady);
        let json: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(json["incremental"], true);
        assert_eq!(SenderReady::from_payload(&frame.payload).unwrap(), ready);
        assert!(SenderReady::from_payload(b"{").is_err());
    }

    #[tokio::test]
    async fn test_read_write_frame_over_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::new(Command::Chunk, Bytes::from_static(b"stream bytes"));
        write_frame(&mut a, &frame).await.unwrap();
        write_frame(&mut a, &Frame::command(Command::BtrfsSendStreamFinished))
            .await
            .unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap(), frame);
        assert_eq!(
            read_frame(&mut b).await.unwrap().command,
            Command::BtrfsSendStreamFinished
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(MAX_FRAME_SIZE + 1).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
