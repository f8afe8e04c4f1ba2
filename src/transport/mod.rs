//! Connection layer between sender and receiver.
//!
//! A connection is addressed by a stable identity and carries `(command,
//! payload)` frames. Delivery is at-most-once: nothing is resent, and a reply
//! that doesn't arrive in time is reported as an empty frame. Recovery is the
//! caller's job, by closing and reopening the connection.

pub mod tcp;

pub use tcp::TcpConnection;

use crate::streaming::protocol::{Command, Frame};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

#[async_trait]
pub trait Transport: Send {
    /// Identity announced to the peer on connect
    fn identity(&self) -> &str;

    /// Peer address, for diagnostics
    fn peer(&self) -> &str;

    /// Establish a fresh connection. Any previous one is closed first.
    async fn open(&mut self) -> Result<()>;

    /// Send one frame. With `send_only` return immediately; otherwise wait for
    /// exactly one reply, or return [`Frame::empty`] when none arrives within
    /// the reply bound.
    async fn send(&mut self, command: Command, payload: Bytes, send_only: bool) -> Result<Frame>;

    /// Wait up to `wait` for a frame from the peer.
    async fn poll(&mut self, wait: Duration) -> Result<Option<Frame>>;

    /// Release the connection. Safe to call repeatedly.
    async fn close(&mut self);
}
