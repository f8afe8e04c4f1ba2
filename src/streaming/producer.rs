//! Byte-stream producer: the `btrfs send` subprocess.
//!
//! Stdout is drained with bounded waits so the sender loop never blocks on
//! it. "No data yet" ([`StreamPoll::Idle`]) is reported separately from
//! end-of-stream ([`StreamPoll::Eof`]), and the exit status is polled without
//! waiting.

use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Result of one stdout poll
#[derive(Debug, PartialEq, Eq)]
pub enum StreamPoll {
    Data(Bytes),
    /// Nothing available within the poll window
    Idle,
    /// Stdout closed
    Eof,
}

/// Starts the subprocess that serializes a snapshot to stdout.
pub trait StreamProducer: Send + Sync {
    fn spawn(&self, snapshot: &Path, parent: Option<&Path>) -> io::Result<ProducerHandle>;
}

/// `btrfs send [-p parent] snapshot`
#[derive(Debug, Clone)]
pub struct BtrfsSend {
    btrfs: PathBuf,
}

impl BtrfsSend {
    pub fn new(btrfs: impl Into<PathBuf>) -> Self {
        Self {
            btrfs: btrfs.into(),
        }
    }
}

impl StreamProducer for BtrfsSend {
    fn spawn(&self, snapshot: &Path, parent: Option<&Path>) -> io::Result<ProducerHandle> {
        let mut cmd = Command::new(&self.btrfs);
        cmd.arg("send");
        if let Some(parent) = parent {
            cmd.arg("-p").arg(parent);
        }
        cmd.arg(snapshot);
        ProducerHandle::spawn(cmd)
    }
}

/// A running producer subprocess.
pub struct ProducerHandle {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    exit: Option<ExitStatus>,
    buf: Vec<u8>,
}

impl ProducerHandle {
    /// Spawn `cmd` with piped stdout/stderr. The child is killed if the
    /// handle is dropped while it still runs.
    pub fn spawn(mut cmd: Command) -> io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("producer stdout not captured"))?;
        let stderr = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let _ = err.read_to_end(&mut raw).await;
                String::from_utf8_lossy(&raw).trim().to_string()
            })
        });

        Ok(Self {
            child,
            stdout,
            stderr,
            exit: None,
            buf: vec![0u8; super::channel::DATA_CHUNK_SIZE],
        })
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.buf = vec![0u8; size.max(1)];
        self
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read whatever stdout has, waiting at most `wait`.
    pub async fn poll_chunk(&mut self, wait: Duration) -> io::Result<StreamPoll> {
        match tokio::time::timeout(wait, self.stdout.read(&mut self.buf)).await {
            Err(_) => Ok(StreamPoll::Idle),
            Ok(Ok(0)) => Ok(StreamPoll::Eof),
            Ok(Ok(n)) => Ok(StreamPoll::Data(Bytes::copy_from_slice(&self.buf[..n]))),
            Ok(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(StreamPoll::Idle),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Exit status if the process has exited. Never waits; the status is
    /// captured once and remembered.
    pub fn try_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?;
        }
        Ok(self.exit)
    }

    /// Wait for exit, bounded by `limit`.
    pub async fn wait_exit(&mut self, limit: Duration) -> io::Result<Option<ExitStatus>> {
        if self.exit.is_none() {
            self.exit = tokio::time::timeout(limit, self.child.wait())
                .await
                .ok()
                .transpose()?;
        }
        Ok(self.exit)
    }

    /// Collected stderr. Only complete once the process has exited.
    pub async fn stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }

    pub async fn kill(&mut self) {
        if self.exit.is_none() {
            let _ = self.child.kill().await;
            self.exit = self.child.try_wait().ok().flatten();
        }
    }
}
