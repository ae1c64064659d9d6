//! Multi-Client Launcher - Main Entry Point
//!
//! Starts one userbot worker per configured slot and keeps them in line
//! with the configuration until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use multi_client::config::{EnvSource, KeyScheme, LauncherSettings, LayeredEnv, Slot};
use multi_client::launcher::{Launcher, LauncherMessage, SlotState};
use multi_client::supervisor::{
    OutputMode, PidRecordStore, Supervisor, WorkerCommand, select_probe,
};
use multi_client::workspace::WorkspaceLayout;

/// Launch several userbot clients from one codebase.
#[derive(Parser, Debug)]
#[command(name = "multi_client")]
#[command(about = "Run up to five independently configured userbot clients")]
#[command(version)]
struct Args {
    /// Path to the .env file holding the per-slot keys.
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Naming convention of the per-slot keys.
    #[arg(long, value_enum)]
    key_scheme: Option<KeyScheme>,

    /// Seconds between two configuration checks.
    #[arg(short, long)]
    interval: Option<u64>,

    /// Seconds a stopped worker gets before it is killed.
    #[arg(long)]
    grace: Option<u64>,

    /// Directory holding the shared code and the client workspaces.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Program started for every client.
    #[arg(long)]
    worker: Option<String>,

    /// Argument passed before the client values (repeatable).
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Write worker output to client_<N>/worker.log and follow it in the launcher log.
    #[arg(long)]
    capture_output: bool,

    /// Print the effective settings as JSON and exit.
    #[arg(long)]
    show_settings: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level);

    let source = LayeredEnv::capture(Some(args.env_file.clone()));
    if !source.env_file_exists() {
        debug!("No settings file at {}", args.env_file.display());
    }

    let mut settings = LauncherSettings::from_env_with_defaults(&source.snapshot());
    apply_overrides(&mut settings, &args);
    settings
        .validate()
        .context("Launcher settings validation failed")?;
    settings.base_dir = std::path::absolute(&settings.base_dir)
        .with_context(|| format!("Failed to resolve {}", settings.base_dir.display()))?;

    if args.show_settings {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(ExitCode::SUCCESS);
    }

    let env_file = std::path::absolute(&args.env_file)
        .with_context(|| format!("Failed to resolve {}", args.env_file.display()))?;
    let layout = WorkspaceLayout::new(
        settings.base_dir.clone(),
        Some(env_file),
        settings.code_assets.clone(),
        settings.data_assets.clone(),
    );
    let output = if settings.capture_output {
        OutputMode::Capture
    } else {
        OutputMode::Inherit
    };
    let supervisor = Supervisor::new(
        WorkerCommand::new(settings.worker_program.clone(), settings.worker_args.clone()),
        output,
        select_probe(),
        PidRecordStore::new(settings.base_dir.clone()),
        settings.grace(),
    );

    info!(
        "Launcher starting (scheme: {}, base: {}, probe: {})",
        settings.key_scheme,
        settings.base_dir.display(),
        supervisor.probe_name()
    );

    let mut launcher = Launcher::new(settings.key_scheme, Box::new(source), layout, supervisor)
        .with_check_interval(settings.interval());

    let report = launcher.start().await;
    print_summary(&launcher);

    if report.nothing_running() {
        error!("No client could be started, check the configuration");
        return Ok(ExitCode::FAILURE);
    }

    let (launcher_tx, launcher_rx) = mpsc::channel::<LauncherMessage>(8);
    let launcher_handle = tokio::spawn(launcher.run(launcher_rx));

    info!("Launcher is running. Use Ctrl+C to stop monitoring.");
    wait_for_interrupt(&launcher_tx).await?;

    // Workers are left running on purpose
    info!("Shutting down...");
    let _ = launcher_tx.send(LauncherMessage::Shutdown).await;
    let _ = launcher_handle.await;

    Ok(ExitCode::SUCCESS)
}

/// Initializes the logging subsystem.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Applies command line values on top of the configured settings.
fn apply_overrides(settings: &mut LauncherSettings, args: &Args) {
    if let Some(scheme) = args.key_scheme {
        settings.key_scheme = scheme;
    }
    if let Some(interval) = args.interval {
        settings.interval_secs = interval;
    }
    if let Some(grace) = args.grace {
        settings.grace_secs = grace;
    }
    if let Some(base_dir) = &args.base_dir {
        settings.base_dir.clone_from(base_dir);
    }
    if let Some(worker) = &args.worker {
        settings.worker_program.clone_from(worker);
    }
    if !args.worker_args.is_empty() {
        settings.worker_args.clone_from(&args.worker_args);
    }
    settings.capture_output |= args.capture_output;
}

/// Logs one line per slot after the first pass.
fn print_summary(launcher: &Launcher) {
    for slot in Slot::all() {
        match launcher.state(slot) {
            SlotState::Running(record) => info!("{}: running (PID {})", slot, record.pid),
            SlotState::Unconfigured { missing } if missing.is_empty() => {
                warn!("{}: not running, retrying on the next check", slot);
            }
            SlotState::Unconfigured { .. } => debug!("{}: not configured", slot),
        }
    }

    info!("{} client(s) running", launcher.running().len());
}

/// Waits for Ctrl+C, turning SIGHUP into an immediate reconcile.
#[cfg(unix)]
async fn wait_for_interrupt(tx: &mpsc::Sender<LauncherMessage>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("Received SIGHUP, reconciling");
                let _ = tx.send(LauncherMessage::Reconcile).await;
            }
        }
    }
}

/// Waits for Ctrl+C.
#[cfg(not(unix))]
async fn wait_for_interrupt(_tx: &mpsc::Sender<LauncherMessage>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");
    Ok(())
}
