//! Admin CLI for the postrider MTA.
//!
//! Exit codes follow sysexits: 0 for success, 75 (tempfail) for transient
//! trouble worth retrying, 69 (unavailable) for permanent errors.

use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use postrider::AppConfig;
use postrider_cleanup::{Cleanup, CleanupConfig, Disposition};
use postrider_common::trigger::{TRIGGER_SCAN, send_trigger};
use postrider_control::{Command, ControlClient, ControlError};
use postrider_maps::MapRegistry;
use postrider_spool::{QueueDirs, QueueId, RecordKind};

const EXIT_TRANSIENT: u8 = 75;
const EXIT_PERMANENT: u8 = 69;

#[derive(Debug, Parser)]
#[command(name = "postriderctl", about = "Administer the postrider MTA")]
struct Cli {
    /// Configuration directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Enqueue a message read from a file (`-` for standard input).
    Enqueue {
        /// Envelope sender address.
        #[arg(long)]
        sender: String,
        /// Envelope recipient addresses.
        #[arg(long = "recipient", required = true)]
        recipients: Vec<String>,
        file: PathBuf,
    },
    /// List queued messages.
    List,
    /// Make deferred mail eligible immediately, optionally for one site.
    Flush { site: Option<String> },
    /// Park a message in the hold queue.
    Hold { id: String },
    /// Release a held message.
    Release { id: String },
    /// Reload the daemon configuration.
    Reload,
    /// Show queue status counters.
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    postrider_common::logging::init();
    let cli = Cli::parse();
    let config_dir = AppConfig::config_dir(cli.config);
    let config = match AppConfig::load(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("postriderctl: {e}");
            return ExitCode::from(EXIT_PERMANENT);
        }
    };

    match run(cli.action, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("postriderctl: {e}");
            if e.downcast_ref::<ControlError>()
                .is_some_and(ControlError::is_transient)
                || e.downcast_ref::<TransientEnqueue>().is_some()
            {
                ExitCode::from(EXIT_TRANSIENT)
            } else {
                ExitCode::from(EXIT_PERMANENT)
            }
        }
    }
}

/// Marker for enqueue failures that a resubmission could fix.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct TransientEnqueue(String);

async fn run(action: Action, config: AppConfig) -> anyhow::Result<()> {
    let control = ControlClient::new(config.params.control_socket_path());
    match action {
        Action::Enqueue {
            sender,
            recipients,
            file,
        } => enqueue(&config, &sender, &recipients, &file).await,
        Action::List => {
            for line in control.execute(Command::List).await?.lines {
                println!("{line}");
            }
            Ok(())
        }
        Action::Flush { site } => {
            let response = control.execute(Command::Flush { site }).await?;
            for line in response.lines {
                println!("{line}");
            }
            Ok(())
        }
        Action::Hold { id } => {
            control.execute(Command::Hold { id: parse_id(&id)? }).await?;
            println!("held {id}");
            Ok(())
        }
        Action::Release { id } => {
            control
                .execute(Command::Release { id: parse_id(&id)? })
                .await?;
            println!("released {id}");
            Ok(())
        }
        Action::Reload => {
            for line in control.execute(Command::Reload).await?.lines {
                println!("{line}");
            }
            Ok(())
        }
        Action::Status => {
            for line in control.execute(Command::Status).await?.lines {
                println!("{line}");
            }
            Ok(())
        }
    }
}

fn parse_id(text: &str) -> anyhow::Result<QueueId> {
    QueueId::from_file_name(text).ok_or_else(|| anyhow::anyhow!("malformed queue id: {text}"))
}

/// Run the message through cleanup and wake the queue manager.
async fn enqueue(
    config: &AppConfig,
    sender: &str,
    recipients: &[String],
    file: &PathBuf,
) -> anyhow::Result<()> {
    let content = if file.as_os_str() == "-" {
        use std::io::Read as _;
        let mut text = String::new();
        std::io::stdin().read_to_string(&mut text)?;
        text
    } else {
        std::fs::read_to_string(file)?
    };

    let dirs = QueueDirs::new(config.params.queue_directory.clone());
    dirs.init()
        .map_err(|e| TransientEnqueue(format!("spool unavailable: {e}")))?;
    let registry = MapRegistry::new();
    let rewriter = Arc::new(config.build_rewriter(&registry)?);
    let params = Arc::new(config.params.clone());

    let mut cleanup = Cleanup::open(
        Arc::clone(&params),
        rewriter,
        CleanupConfig {
            virtual_aliases: config.build_aliases(&registry)?,
            inspector: None,
        },
        dirs,
    )
    .map_err(|e| TransientEnqueue(e.to_string()))?;

    cleanup.process(RecordKind::From, sender.as_bytes())?;
    cleanup.process(RecordKind::Time, now_secs().to_string().as_bytes())?;
    for recipient in recipients {
        cleanup.process(RecordKind::Recipient, recipient.as_bytes())?;
    }
    cleanup.process(RecordKind::Mesg, b"")?;
    for line in content.lines() {
        cleanup.process(RecordKind::Norm, line.as_bytes())?;
    }
    cleanup.process(RecordKind::Xtra, b"")?;
    cleanup.process(RecordKind::End, b"")?;

    match cleanup.finish()? {
        Disposition::Enqueued(id) => {
            println!("{id}");
            // Best effort: the periodic scan picks the message up anyway.
            let _ = send_trigger(
                &config.params.qmgr_trigger_path(),
                &[TRIGGER_SCAN],
                Duration::from_secs(5),
            )
            .await;
            Ok(())
        }
        Disposition::Held(id) => {
            println!("{id} (held)");
            Ok(())
        }
        Disposition::Bounced { .. } => Err(anyhow::anyhow!("message rejected during cleanup")),
        Disposition::Discarded => {
            println!("(discarded)");
            Ok(())
        }
        Disposition::Corrupt(id) => Err(anyhow::anyhow!("message {id} could not be stored")),
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
