//! The postrider daemon.
//!
//! Runs as the master supervisor (spawning the other roles as worker
//! processes) or as one of the roles directly.

use std::{
    os::fd::{FromRawFd as _, OwnedFd},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use postrider::{AppConfig, Handler};
use postrider_common::{Runtime, Signal, flow::FlowProducer};
use postrider_control::ControlServer;
use postrider_maps::MapRegistry;
use postrider_master::{Master, MasterCommand};
use postrider_qmgr::{QueueManager, SocketConnector};
use postrider_spool::QueueDirs;
use tokio::{signal::unix, sync::broadcast, sync::mpsc};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "postrider", about = "A mail transfer agent core")]
struct Cli {
    /// Configuration directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Debug, Subcommand)]
enum Role {
    /// Supervise the configured services.
    Master,
    /// Run the queue manager and the control service.
    Qmgr,
}

fn main() -> anyhow::Result<()> {
    postrider_common::logging::init();
    let cli = Cli::parse();
    let config_dir = AppConfig::config_dir(cli.config);
    let config = AppConfig::load(&config_dir)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?;
    match cli.role {
        Role::Master => runtime.block_on(run_master(config)),
        Role::Qmgr => runtime.block_on(run_qmgr(config, config_dir)),
    }
}

/// Broadcast shutdown on SIGTERM/SIGINT, reload on SIGHUP.
fn watch_signals(signals: broadcast::Sender<Signal>) -> anyhow::Result<()> {
    let mut term = unix::signal(unix::SignalKind::terminate())?;
    let mut int = unix::signal(unix::SignalKind::interrupt())?;
    let mut hup = unix::signal(unix::SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                _ = term.recv() => Signal::Shutdown,
                _ = int.recv() => Signal::Shutdown,
                _ = hup.recv() => Signal::Reload,
            };
            if signals.send(signal).is_err() {
                return;
            }
        }
    });
    Ok(())
}

async fn run_master(config: AppConfig) -> anyhow::Result<()> {
    let (signals, shutdown) = broadcast::channel(4);
    watch_signals(signals)?;

    let master = Master::new(config.services)?;
    let (_commands_tx, commands_rx) = mpsc::channel::<MasterCommand>(16);
    master.run(commands_rx, shutdown).await?;
    Ok(())
}

async fn run_qmgr(config: AppConfig, config_dir: PathBuf) -> anyhow::Result<()> {
    let (signals, shutdown) = broadcast::channel(4);
    watch_signals(signals.clone())?;

    let registry = MapRegistry::new();
    let resolver = Arc::new(config.build_resolver(&registry)?);
    let rewriter = Arc::new(config.build_rewriter(&registry)?);
    let params = config.params.clone();

    let dirs = QueueDirs::new(params.queue_directory.clone());
    dirs.init()?;

    let connector = Arc::new(SocketConnector::new(
        params.public_path(),
        std::time::Duration::from_secs(params.delivery_timeout_secs),
    ));
    let runtime = Arc::new(Runtime::new(params.clone()));
    let mut manager = QueueManager::new(
        Arc::clone(&runtime),
        dirs.clone(),
        resolver,
        Arc::clone(&rewriter),
        connector,
    );

    // The producing end of the flow pipe, when the master handed one down.
    if let Some(producer) = inherited_flow_producer()? {
        manager = manager.with_flow(producer);
        info!("flow-control pipe attached");
    }
    let manager = Arc::new(manager);

    let control = ControlServer::bind(&params.control_socket_path())
        .map_err(|e| anyhow::anyhow!("control socket: {e}"))?;
    let handler = Arc::new(Handler {
        runtime: Arc::clone(&runtime),
        dirs,
        manager: Arc::clone(&manager),
        config_dir,
        signals,
    });
    tokio::spawn(async move { control.serve(handler).await });

    if let Err(e) = manager.run(shutdown).await {
        error!(error = %e, "queue manager failed");
        return Err(e.into());
    }
    Ok(())
}

/// Adopt the flow-pipe producing end inherited from the master, if any.
fn inherited_flow_producer() -> anyhow::Result<Option<FlowProducer>> {
    let Some(fds) = std::env::var_os(postrider_master::spawn::FLOW_ENV) else {
        return Ok(None);
    };
    let fds = fds.to_string_lossy();
    let write_fd: i32 = fds
        .split(',')
        .nth(1)
        .and_then(|fd| fd.parse().ok())
        .context("malformed POSTRIDER_FLOW_FDS")?;
    // Safety: the master set this descriptor up for us before exec.
    let owned = unsafe { OwnedFd::from_raw_fd(write_fd) };
    Ok(Some(FlowProducer::from_owned_fd(owned)?))
}
