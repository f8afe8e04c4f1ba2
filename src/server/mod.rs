//! Receiver daemon - runs when invoked as `snaprep receive`
//!
//! Accepts sender connections over TCP. Each connection opens with a hello
//! frame naming the sender identity; frames are then routed to the session for
//! that identity. A reconnect under the same identity takes the session over
//! and discards whatever the previous connection left half-received.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::streaming::protocol::{read_frame, write_frame, Hello, PROTOCOL_VERSION};
use crate::streaming::receiver::{ReceiverConfig, ReceiverFacade, ReceiverSession};

/// A connection must say hello within this long
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

type Sessions = Arc<Mutex<HashMap<String, Arc<Mutex<ReceiverSession>>>>>;

pub struct ReceiverServer {
    listener: TcpListener,
    config: ReceiverConfig,
    facade: ReceiverFacade,
    sessions: Sessions,
}

impl ReceiverServer {
    pub async fn bind(addr: &str, config: ReceiverConfig, facade: ReceiverFacade) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        Ok(Self {
            listener,
            config,
            facade,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl+C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.serve_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` completes.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Receiver listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let sessions = self.sessions.clone();
            let config = self.config.clone();
            let facade = self.facade.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, sessions, config, facade).await {
                    error!("Connection from {} failed: {:#}", peer, e);
                }
            });
        }

        info!("Receiver shutting down");
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            session.lock().await.abort("receiver shutting down").await;
        }
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    sessions: Sessions,
    config: ReceiverConfig,
    facade: ReceiverFacade,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let frame = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut reader))
        .await
        .with_context(|| format!("No hello from {}", peer))??;
    let hello = Hello::from_frame(&frame)?;
    if hello.version != PROTOCOL_VERSION {
        warn!(
            "{} ({}) speaks protocol {}, expected {}; closing",
            hello.identity, peer, hello.version, PROTOCOL_VERSION
        );
        return Ok(());
    }

    let session = {
        let mut map = sessions.lock().await;
        map.entry(hello.identity.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ReceiverSession::new(
                    hello.identity.clone(),
                    config,
                    facade,
                )))
            })
            .clone()
    };
    let generation = session.lock().await.attach().await;
    info!("{} connected from {}", hello.identity, peer);

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{}: read ended: {:#}", hello.identity, e);
                break;
            }
        };

        let mut session = session.lock().await;
        if session.generation() != generation {
            debug!("{}: connection from {} superseded", hello.identity, peer);
            return Ok(());
        }
        if let Some(reply) = session.handle(frame).await {
            if let Err(e) = write_frame(&mut writer, &reply).await {
                debug!("{}: write failed: {:#}", hello.identity, e);
                break;
            }
        }
    }

    let mut session = session.lock().await;
    if session.generation() == generation && session.is_receiving() {
        session.abort("connection lost").await;
    }
    info!("{} disconnected", hello.identity);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
