//! custodianctl - command-line control client for custodiand

mod render;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use custodian_api::Command;
use custodian_ipc::IpcClient;
use custodian_util::default_socket_path;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// custodianctl - inspect and steer custodiand
#[derive(Parser, Debug)]
#[command(name = "custodianctl")]
#[command(about = "Control client for custodiand", long_about = None)]
struct Args {
    /// Socket path for custodiand connection (or set CUSTODIAN_SOCKET env var)
    #[arg(short, long, env = "CUSTODIAN_SOCKET")]
    socket: Option<PathBuf>,

    /// Print raw JSON instead of text
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Show the current status
    Status,

    /// Evaluate now instead of waiting for the next trigger
    Evaluate {
        /// Delay in seconds before evaluating (default: immediately)
        #[arg(long)]
        delay: Option<f64>,
    },

    /// Enable automation
    Enable,

    /// Disable automation (running target is left alone)
    Disable,

    /// Set the managed program; pass neither flag to clear it
    SetTarget {
        /// Application identifier, e.g. org.example.SyncAgent
        #[arg(long)]
        identifier: Option<String>,

        /// Application name, used when no identifier is given
        #[arg(long)]
        name: Option<String>,
    },

    /// Set the trusted wireless network; empty means any network
    SetNetwork { network: String },

    /// Stream events until interrupted
    Watch,

    /// Check that the service answers
    Ping,
}

impl Action {
    fn command(&self) -> Result<Command> {
        let command = match self {
            Action::Status => Command::GetStatus,
            Action::Evaluate { delay } => Command::TriggerEvaluation {
                source: None,
                delay: Some(match delay {
                    Some(seconds) => Duration::try_from_secs_f64(*seconds)
                        .context("Delay must be a non-negative number of seconds")?,
                    None => Duration::ZERO,
                }),
            },
            Action::Enable => Command::SetAutomationEnabled { enabled: true },
            Action::Disable => Command::SetAutomationEnabled { enabled: false },
            Action::SetTarget { identifier, name } => Command::SetTarget {
                identifier: identifier.clone(),
                name: name.clone(),
            },
            Action::SetNetwork { network } => Command::SetRequiredNetwork {
                network: network.clone(),
            },
            Action::Watch => Command::SubscribeEvents,
            Action::Ping => Command::Ping,
        };
        Ok(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let socket_path = args.socket.clone().unwrap_or_else(default_socket_path);
    tracing::debug!(path = %socket_path.display(), "Connecting to custodiand");

    let mut client = IpcClient::connect(&socket_path)
        .await
        .with_context(|| format!("Failed to connect to custodiand at {:?}", socket_path))?;

    if let Action::Watch = args.action {
        let mut events = client.subscribe().await?;
        loop {
            let event = events.next().await.context("Event stream ended")?;
            if args.json {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                println!(
                    "{} {}",
                    event.timestamp.format("%H:%M:%S"),
                    render::event(&event.payload)
                );
            }
        }
    }

    let payload = client.call(args.action.command()?).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", render::payload(&payload));
    }

    Ok(())
}
