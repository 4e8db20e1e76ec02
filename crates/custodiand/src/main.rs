//! custodiand - keeps one background program running only while the
//! machine's power and network conditions allow it.
//!
//! This binary wires together:
//! - Configuration loading (and reload on SIGHUP)
//! - The Linux host adapter and its event sources
//! - The controller
//! - The control socket

use anyhow::{Context, Result};
use clap::Parser;
use custodian_config::{load_config, restart_required, Settings};
use custodian_core::Controller;
use custodian_host_linux::{LinuxHost, SourceIntervals};
use custodian_ipc::IpcServer;
use custodian_util::default_config_path;
use custodiand::{Service, ServiceSignal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// custodiand - condition-driven process custodian
#[derive(Parser, Debug)]
#[command(name = "custodiand")]
#[command(about = "Runs one program only while power and network conditions allow it", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/custodian/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set CUSTODIAN_SOCKET env var)
    #[arg(short, long, env = "CUSTODIAN_SOCKET")]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// A missing file means "not configured"; a broken one is fatal
fn load_startup_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        warn!(
            config_path = %path.display(),
            "Config file not found, starting unconfigured"
        );
        return Ok(Settings::default());
    }

    let loaded = load_config(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;

    info!(
        config_path = %path.display(),
        target = ?loaded.settings.target,
        corrections = loaded.issues.len(),
        "Configuration loaded"
    );

    Ok(loaded.settings)
}

/// Forward SIGTERM/SIGINT as shutdown and SIGHUP as a config reload.
///
/// The probe is reconfigured here; settings bound at startup are compared
/// against `startup` and reported instead of silently ignored.
fn spawn_signal_task(
    config_path: PathBuf,
    host: Arc<LinuxHost>,
    startup: Settings,
    signals: mpsc::UnboundedSender<ServiceSignal>,
) -> Result<JoinHandle<()>> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    let _ = signals.send(ServiceSignal::Shutdown);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    let _ = signals.send(ServiceSignal::Shutdown);
                    break;
                }
                _ = sighup.recv() => {
                    info!(config_path = %config_path.display(), "Received SIGHUP, reloading configuration");
                    match load_config(&config_path) {
                        Ok(loaded) => {
                            for issue in restart_required(&startup, &loaded.settings) {
                                warn!(issue = %issue, "Reloaded setting not applied");
                            }
                            let probe = &loaded.settings.connectivity;
                            host.reconfigure_probe(&probe.check_url, probe.check_timeout);
                            if signals.send(ServiceSignal::Reload(loaded.settings)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Reload failed, keeping current settings");
                        }
                    }
                }
            }
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "custodiand starting");

    let settings = load_startup_settings(&args.config)?;

    let host = Arc::new(
        LinuxHost::new(
            &settings.connectivity.check_url,
            settings.connectivity.check_timeout,
        )
        .context("Failed to initialize host adapter")?,
    );

    let (mut controller, channels) = Controller::new(&settings, host.clone(), host.clone());

    let intervals = SourceIntervals {
        power: settings.watchers.power_poll,
        process: settings.watchers.process_poll,
        reachability: settings.watchers.reachability_poll,
        wake: settings.watchers.wake_check,
    };
    for source in host.event_sources(intervals, controller.watch_target()) {
        controller.register_source(source);
    }

    let socket_path = args
        .socket
        .clone()
        .unwrap_or_else(|| settings.service.socket_path.clone());
    let mut ipc = IpcServer::new(&socket_path);
    ipc.start()
        .await
        .with_context(|| format!("Failed to listen on {:?}", socket_path))?;

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let signal_task = spawn_signal_task(args.config.clone(), host, settings, signal_tx)?;

    let result = Service::new(controller, channels, ipc).run(signal_rx).await;
    signal_task.abort();
    result
}
