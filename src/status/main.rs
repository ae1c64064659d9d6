//! Standalone status tool for launcher slots.
//!
//! Shows which slots resolve to a complete configuration, which PID each
//! slot has on record and whether that process is still alive. Can also
//! stop every recorded worker.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;

// Import from the main crate
use multi_client::config::{
    EnvSnapshot, EnvSource, KeyScheme, LauncherSettings, LayeredEnv, Resolution, Slot, resolve,
};
use multi_client::supervisor::{
    Liveness, LivenessProbe, PidRecordStore, StopSignal, select_probe, stop_process,
};

/// Launcher slot status.
#[derive(Parser, Debug)]
#[command(name = "slot_status")]
#[command(about = "Shows the configuration and worker state of every launcher slot")]
#[command(version)]
struct Args {
    /// Path to the .env file holding the per-slot keys.
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Naming convention of the per-slot keys.
    #[arg(long, value_enum)]
    key_scheme: Option<KeyScheme>,

    /// Directory holding the client workspaces and PID records.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Ask every recorded worker to stop and remove its record.
    #[arg(long)]
    stop: bool,
}

/// Status of one slot.
#[derive(Debug, Serialize)]
struct SlotReport {
    slot: Slot,
    configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    liveness: Option<Liveness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_workspace: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recorded_at: Option<DateTime<Utc>>,
    stopped: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let env = LayeredEnv::capture(Some(args.env_file.clone())).snapshot();
    let settings = LauncherSettings::from_env_with_defaults(&env);
    let scheme = args.key_scheme.unwrap_or(settings.key_scheme);
    let records = PidRecordStore::new(args.base_dir.unwrap_or(settings.base_dir));
    let probe = select_probe();

    let reports: Vec<SlotReport> = Slot::all()
        .map(|slot| {
            let mut report = inspect(slot, scheme, &env, &records, probe.as_ref());
            if args.stop {
                stop(&mut report, &records);
            }
            report
        })
        .collect();

    if args.json {
        match serde_json::to_string_pretty(&reports) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("✗ Failed to encode report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_reports(&reports, scheme, &records);
    }

    if reports.iter().any(|r| r.configured) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn inspect(
    slot: Slot,
    scheme: KeyScheme,
    env: &EnvSnapshot,
    records: &PidRecordStore,
    probe: &dyn LivenessProbe,
) -> SlotReport {
    let (configured, namespace, missing) = match resolve(slot, scheme, env) {
        Resolution::Configured(config) => (true, Some(config.namespace), Vec::new()),
        Resolution::Unconfigured { missing, .. } => (false, None, missing),
    };
    let pid = records.load(slot);
    let workspace = records.dir().join(format!("client_{}", slot.index()));

    SlotReport {
        slot,
        configured,
        namespace,
        missing,
        pid,
        liveness: pid.map(|pid| probe.liveness(pid)),
        in_workspace: pid.and_then(|pid| probe.runs_in(pid, &workspace)),
        recorded_at: records.written_at(slot).map(DateTime::<Utc>::from),
        stopped: false,
    }
}

fn stop(report: &mut SlotReport, records: &PidRecordStore) {
    let Some(pid) = report.pid else {
        return;
    };

    // A reused PID outside the workspace is someone else's process.
    if report.liveness != Some(Liveness::Dead) && report.in_workspace != Some(false) {
        match stop_process(pid, StopSignal::Graceful) {
            Ok(sent) => report.stopped = sent,
            Err(e) => {
                eprintln!("✗ {}: {e}", report.slot);
                return;
            }
        }
    }

    if let Err(e) = records.clear(report.slot) {
        eprintln!("✗ {}: failed to remove PID record: {e}", report.slot);
    }
}

fn print_reports(reports: &[SlotReport], scheme: KeyScheme, records: &PidRecordStore) {
    println!("Key scheme: {scheme}");
    println!("Records: {}\n", records.dir().display());

    for report in reports {
        if report.configured {
            println!(
                "✓ {}: configured (namespace {})",
                report.slot,
                report.namespace.as_deref().unwrap_or("-")
            );
        } else {
            println!("✗ {}: missing {}", report.slot, report.missing.join(", "));
        }

        if let (Some(pid), Some(liveness)) = (report.pid, report.liveness) {
            let since = report
                .recorded_at
                .map(|at| format!(", recorded {}", at.format("%Y-%m-%d %H:%M:%S UTC")))
                .unwrap_or_default();
            println!("  PID {pid}: {liveness}{since}");
            if report.in_workspace == Some(false) {
                println!("  ⚠ not running in client_{}, not a worker", report.slot.index());
            }
            if report.stopped {
                println!("  stop signal sent");
            }
        }
    }

    let configured = reports.iter().filter(|r| r.configured).count();
    let alive = reports
        .iter()
        .filter(|r| r.liveness == Some(Liveness::Alive))
        .count();
    println!("\n{configured} configured, {alive} alive");
}
