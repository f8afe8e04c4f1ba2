//! Byte-stream consumer: the `btrfs receive` subprocess on the receiving side.

use anyhow::{Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Starts the subprocess that applies a stream inside `dest_dir`.
pub trait StreamConsumer: Send + Sync {
    fn spawn(&self, dest_dir: &Path, snap: &str) -> io::Result<ConsumerHandle>;
}

/// `btrfs receive dest_dir`. The snapshot name travels inside the stream.
#[derive(Debug, Clone)]
pub struct BtrfsReceive {
    btrfs: PathBuf,
}

impl BtrfsReceive {
    pub fn new(btrfs: impl Into<PathBuf>) -> Self {
        Self {
            btrfs: btrfs.into(),
        }
    }
}

impl StreamConsumer for BtrfsReceive {
    fn spawn(&self, dest_dir: &Path, _snap: &str) -> io::Result<ConsumerHandle> {
        let mut cmd = Command::new(&self.btrfs);
        cmd.arg("receive").arg(dest_dir);
        ConsumerHandle::spawn(cmd)
    }
}

/// A running consumer subprocess.
pub struct ConsumerHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    bytes_written: u64,
}

impl ConsumerHandle {
    pub fn spawn(mut cmd: Command) -> io::Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let _ = err.read_to_end(&mut raw).await;
                String::from_utf8_lossy(&raw).trim().to_string()
            })
        });

        Ok(Self {
            child,
            stdin,
            stderr,
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Feed one chunk of stream data.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .context("Consumer input already closed")?;
        let written = stdin.write_all(data).await;
        if let Err(e) = written {
            // Broken pipe: the consumer died, its stderr says why
            let _ = self.child.kill().await;
            let stderr = self.take_stderr().await;
            anyhow::bail!("Failed to write stream data: {} {}", e, stderr);
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Close input and wait for the consumer to apply the stream.
    pub async fn finish(mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        let status = self
            .child
            .wait()
            .await
            .context("Failed to wait for stream consumer")?;
        if !status.success() {
            let stderr = self.take_stderr().await;
            anyhow::bail!("Stream consumer exited with {}: {}", status, stderr);
        }
        Ok(())
    }

    /// Kill the consumer, discarding whatever it received.
    pub async fn abort(mut self) {
        self.stdin.take();
        let _ = self.child.kill().await;
    }

    async fn take_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}
