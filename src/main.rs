//! # snaprep
//!
//! - `snaprep send --task FILE --appliance-uuid UUID` runs one replication round
//! - `snaprep receive` runs the receiver daemon
//! - `snaprep trails --task-key KEY` prints the trail history as JSON lines

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use snaprep::config::{self, Config};
use snaprep::server::ReceiverServer;
use snaprep::snapshot::BtrfsSnapshots;
use snaprep::streaming::{
    BtrfsReceive, BtrfsSend, Facade, ReceiverConfig, ReceiverFacade, RoundOutcome, Sender,
};
use snaprep::trail::{FileTrailStore, TrailStore};
use snaprep::transport::TcpConnection;
use snaprep::ReplicationError;

/// btrfs snapshot replication between appliances
#[derive(Parser)]
#[command(name = "snaprep")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = config::CONFIG_ENV, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one replication round for a task
    Send {
        /// Task description (TOML)
        #[arg(long, value_name = "FILE")]
        task: PathBuf,

        /// UUID of this appliance
        #[arg(long)]
        appliance_uuid: String,

        /// Override the task's receiver address
        #[arg(long)]
        receiver_ip: Option<String>,
    },

    /// Accept replication streams from senders
    Receive,

    /// Print the trail history of a task as JSON lines
    Trails {
        /// Replication identity, `{appliance-uuid}-{task-id}`
        #[arg(long)]
        task_key: String,

        /// Read the receiver's history instead of the sender's
        #[arg(long)]
        receiver: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("{:#}", e);
        return ExitCode::from(1);
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return exit_code(&e);
        }
    };

    match cli.command {
        Commands::Send {
            task,
            appliance_uuid,
            receiver_ip,
        } => match send(&config, &task, &appliance_uuid, receiver_ip).await {
            Ok(RoundOutcome::Sent { kb_sent, .. }) => {
                info!("Round complete: {} kB sent", kb_sent);
                ExitCode::SUCCESS
            }
            Ok(RoundOutcome::AlreadyPresent) => {
                info!("Round complete: receiver already up to date");
                ExitCode::SUCCESS
            }
            Err(e) => exit_code(&e),
        },
        Commands::Receive => match receive(&config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{:#}", e);
                ExitCode::from(1)
            }
        },
        Commands::Trails { task_key, receiver } => {
            let state_dir = if receiver {
                &config.receiver.state_dir
            } else {
                &config.sender.state_dir
            };
            match print_trails(state_dir, &task_key) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{:#}", e);
                    ExitCode::from(7)
                }
            }
        }
    }
}

async fn send(
    config: &Config,
    task_path: &std::path::Path,
    appliance_uuid: &str,
    receiver_ip: Option<String>,
) -> Result<RoundOutcome, ReplicationError> {
    let settings = &config.sender;
    let mut task = config::load_task(task_path)?;
    if let Some(ip) = receiver_ip {
        task.receiver = ip;
    }
    let identity = task.identity(appliance_uuid);

    let trails = Arc::new(
        FileTrailStore::open(&settings.state_dir)
            .map_err(|e| ReplicationError::Config(format!("{:#}", e)))?,
    );
    let prior = trails
        .list_succeeded_trails(&identity)
        .map_err(|e| ReplicationError::TrailCreate {
            snap: String::new(),
            reason: format!("{:#}", e),
        })?
        .into_iter()
        .next();

    let facade = Facade {
        snapshots: Arc::new(BtrfsSnapshots::new(&settings.btrfs, &settings.mnt_root)),
        trails,
        producer: Arc::new(BtrfsSend::new(&settings.btrfs)),
    };
    let transport = TcpConnection::new(&identity, task.receiver_addr())
        .with_reply_timeout(settings.reply_timeout());

    Sender::new(
        settings.sender_config(appliance_uuid),
        task,
        prior,
        facade,
        transport,
    )
    .with_task_lock(&settings.state_dir)
    .run()
    .await
}

async fn receive(config: &Config) -> Result<()> {
    let settings = &config.receiver;
    let facade = ReceiverFacade {
        snapshots: Arc::new(BtrfsSnapshots::new(&settings.btrfs, &settings.mnt_root)),
        trails: Arc::new(FileTrailStore::open(&settings.state_dir)?),
        consumer: Arc::new(BtrfsReceive::new(&settings.btrfs)),
    };
    let server = ReceiverServer::bind(
        &settings.listen,
        ReceiverConfig {
            max_snap_retain: settings.max_snap_retain,
        },
        facade,
    )
    .await?;
    server.run().await
}

fn print_trails(state_dir: &std::path::Path, task_key: &str) -> Result<()> {
    let store = FileTrailStore::open(state_dir)?;
    for trail in store.list_trails(task_key)? {
        println!(
            "{}",
            serde_json::to_string(&trail).context("Failed to encode trail")?
        );
    }
    Ok(())
}

fn exit_code(err: &ReplicationError) -> ExitCode {
    ExitCode::from(err.exit_code() as u8)
}

/// Initialize tracing subscriber for logging
fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    Ok(())
}
