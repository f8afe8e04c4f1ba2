//! TCP transport - one outbound connection per replication identity
//!
//! Incoming frames are read by a dedicated task and queued, so a reply wait
//! can time out without leaving a half-read frame behind.

use super::Transport;
use crate::streaming::channel::REPLY_TIMEOUT;
use crate::streaming::protocol::{read_frame, write_frame, Command, Frame, Hello};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connect attempts give up after this long
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames buffered from the peer before the read task waits
const INCOMING_QUEUE: usize = 16;

struct Live {
    writer: OwnedWriteHalf,
    incoming: mpsc::Receiver<Frame>,
    read_task: JoinHandle<()>,
}

/// Manages the connection to a remote receiver
pub struct TcpConnection {
    identity: String,
    peer: String,
    reply_timeout: Duration,
    live: Option<Live>,
}

impl TcpConnection {
    pub fn new(identity: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            peer: peer.into(),
            reply_timeout: REPLY_TIMEOUT,
            live: None,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// Read loop that forwards frames to the incoming queue.
    async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Frame>) {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Connection read loop ended: {:#}", e);
                    break;
                }
            }
        }
    }

    fn live(&mut self) -> Result<&mut Live> {
        self.live
            .as_mut()
            .with_context(|| format!("Connection to {} is not open", self.peer))
    }
}

#[async_trait]
impl Transport for TcpConnection {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    async fn open(&mut self) -> Result<()> {
        self.close().await;

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.peer))
            .await
            .with_context(|| format!("Timed out connecting to {}", self.peer))?
            .with_context(|| format!("Failed to connect to {}", self.peer))?;
        stream.set_nodelay(true)?;
        #[allow(deprecated)]
        stream.set_linger(Some(Duration::ZERO))?;

        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &Hello::new(&self.identity).to_frame())
            .await
            .context("Failed to announce identity")?;

        let (tx, incoming) = mpsc::channel(INCOMING_QUEUE);
        let read_task = tokio::spawn(Self::read_loop(reader, tx));

        debug!("Connected to {} as {}", self.peer, self.identity);
        self.live = Some(Live {
            writer,
            incoming,
            read_task,
        });
        Ok(())
    }

    async fn send(&mut self, command: Command, payload: Bytes, send_only: bool) -> Result<Frame> {
        let reply_timeout = self.reply_timeout;
        let live = self.live()?;
        let frame = Frame::new(command, payload);
        match tokio::time::timeout(reply_timeout, write_frame(&mut live.writer, &frame)).await {
            Ok(written) => written?,
            Err(_) => {
                // The peer stopped reading; the frame may be partly written
                warn!(
                    "Write to {} stalled for {}s",
                    self.peer,
                    reply_timeout.as_secs()
                );
                return Ok(Frame::empty());
            }
        }

        if send_only {
            return Ok(Frame::empty());
        }

        match tokio::time::timeout(reply_timeout, live.incoming.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => anyhow::bail!("Connection closed by {}", self.peer),
            Err(_) => {
                warn!(
                    "No reply from {} within {}s",
                    self.peer,
                    reply_timeout.as_secs()
                );
                Ok(Frame::empty())
            }
        }
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<Frame>> {
        let live = self.live()?;
        match tokio::time::timeout(wait, live.incoming.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => anyhow::bail!("Connection closed by {}", self.peer),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        if let Some(live) = self.live.take() {
            live.read_task.abort();
            // Zero linger: pending data is discarded with the socket
            drop(live.writer);
            debug!("Closed connection to {}", self.peer);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            live.read_task.abort();
        }
    }
}
