//! Worker process spawning and lifecycle.

use std::fs::{File, OpenOptions};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::probe::{Liveness, LivenessProbe};
use super::record::PidRecordStore;
use super::signal::{SignalError, StopSignal, stop_process};
use crate::config::{EnvSnapshot, Slot, SlotConfig};
use crate::workspace::Workspace;

/// How often a retiring worker is polled while it shuts down.
const RETIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a killed worker gets to disappear before it is given up on.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// How often a followed worker log is checked for new output.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// File inside the workspace receiving worker output in capture mode.
pub const WORKER_LOG: &str = "worker.log";

/// Errors that can occur when starting a worker.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open worker log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Worker exited before its PID could be read")]
    NoPid,

    #[error("Failed to write PID record {}: {source}", .path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Program and leading arguments shared by every slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Creates a worker command.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

/// What happens to the worker's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Share the launcher's stdout/stderr.
    #[default]
    Inherit,
    /// Append stdout/stderr to `worker.log` in the workspace and follow
    /// that file into the launcher log, one event per line.
    Capture,
}

/// A worker process tracked for one slot.
#[derive(Debug)]
pub struct ProcessRecord {
    /// Slot the worker serves.
    pub slot: Slot,

    /// Operating system process identifier.
    pub pid: u32,

    /// When the worker was started (or its record written, if adopted).
    pub started_at: DateTime<Utc>,

    /// Child handle, present only for workers spawned by this launcher.
    child: Option<Child>,

    /// Task copying the worker log into the launcher log.
    follower: Option<JoinHandle<()>>,
}

impl ProcessRecord {
    /// Returns true if this launcher spawned the worker.
    #[must_use]
    pub const fn is_owned(&self) -> bool {
        self.child.is_some()
    }

    /// Returns how long the worker has been running.
    #[must_use]
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

impl Drop for ProcessRecord {
    fn drop(&mut self) {
        if let Some(follower) = self.follower.take() {
            follower.abort();
        }
    }
}

/// Starts, probes and stops worker processes.
pub struct Supervisor {
    command: WorkerCommand,
    output: OutputMode,
    probe: Box<dyn LivenessProbe>,
    records: PidRecordStore,
    grace: Duration,
}

impl Supervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(
        command: WorkerCommand,
        output: OutputMode,
        probe: Box<dyn LivenessProbe>,
        records: PidRecordStore,
        grace: Duration,
    ) -> Self {
        Self {
            command,
            output,
            probe,
            records,
            grace,
        }
    }

    /// Returns the PID record store.
    #[must_use]
    pub const fn records(&self) -> &PidRecordStore {
        &self.records
    }

    /// Starts the worker of a configured slot.
    ///
    /// The worker inherits `base_env` with `overlay` on top, runs inside the
    /// workspace and receives the required values plus the slot index as
    /// positional arguments. It is placed in its own process group with no
    /// stdin, and in capture mode writes to a file rather than a pipe, so
    /// it keeps running after the launcher exits.
    ///
    /// A worker whose PID record cannot be written is killed again, since it
    /// could never be found by a later run.
    pub fn spawn(
        &self,
        config: &SlotConfig,
        workspace: &Workspace,
        base_env: &EnvSnapshot,
        overlay: &[(String, String)],
    ) -> Result<ProcessRecord, SpawnError> {
        let slot = config.slot;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .args(config.worker_args())
            .current_dir(&workspace.root)
            .env_clear()
            .envs(base_env.iter())
            .envs(overlay.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());

        let log = match self.output {
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
                None
            }
            OutputMode::Capture => {
                let path = workspace.root.join(WORKER_LOG);
                let (stdout, offset) = open_log(&path)
                    .map_err(|source| SpawnError::Log { path: path.clone(), source })?;
                let stderr = stdout
                    .try_clone()
                    .map_err(|source| SpawnError::Log { path: path.clone(), source })?;
                cmd.stdout(stdout).stderr(stderr);
                Some((path, offset))
            }
        };

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            program: self.command.program.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SpawnError::NoPid);
        };

        if let Err(source) = self.records.save(slot, pid) {
            warn!("{}: PID record failed, stopping PID {}", slot, pid);
            if let Err(e) = child.start_kill() {
                warn!("{}: {}", slot, e);
            }
            return Err(SpawnError::Record {
                path: self.records.path(slot),
                source,
            });
        }

        let follower = log.map(|(path, offset)| tokio::spawn(follow_log(slot, path, offset)));

        Ok(ProcessRecord {
            slot,
            pid,
            started_at: Utc::now(),
            child: Some(child),
            follower,
        })
    }

    /// Rebuilds the record of a worker started by an earlier launcher run.
    #[must_use]
    pub fn recover(&self, slot: Slot) -> Option<ProcessRecord> {
        let pid = self.records.load(slot)?;
        let started_at = self
            .records
            .written_at(slot)
            .map_or_else(Utc::now, DateTime::<Utc>::from);

        Some(ProcessRecord {
            slot,
            pid,
            started_at,
            child: None,
            follower: None,
        })
    }

    /// Checks whether the worker is still running.
    ///
    /// Owned workers are checked with a non-blocking wait, which also reaps
    /// them; adopted ones go through the liveness probe.
    pub fn is_alive(&self, record: &mut ProcessRecord) -> Liveness {
        let Some(child) = record.child.as_mut() else {
            return self.probe.liveness(record.pid);
        };

        match child.try_wait() {
            Ok(None) => Liveness::Alive,
            Ok(Some(status)) => {
                debug!("{}: PID {} exited with {}", record.slot, record.pid, status);
                Liveness::Dead
            }
            Err(e) => {
                warn!("{}: could not check PID {}: {}", record.slot, record.pid, e);
                Liveness::Unknown
            }
        }
    }

    /// Checks that a recovered PID still belongs to the worker of `workspace`.
    ///
    /// Workers spawned by this launcher always do. For others the probe
    /// compares the process working directory; `None` means it cannot tell.
    pub fn runs_in(&self, record: &ProcessRecord, workspace: &Path) -> Option<bool> {
        if record.is_owned() {
            return Some(true);
        }
        self.probe.runs_in(record.pid, workspace)
    }

    /// Asks the worker to stop. Never escalates on its own.
    pub fn terminate(&self, record: &ProcessRecord) -> Result<bool, SignalError> {
        stop_process(record.pid, StopSignal::Graceful)
    }

    /// Kills the worker immediately.
    pub fn kill(&self, record: &ProcessRecord) -> Result<bool, SignalError> {
        stop_process(record.pid, StopSignal::Force)
    }

    /// Stops a worker whose slot lost its configuration and clears its record.
    ///
    /// Sends a graceful stop, waits up to the grace period and kills the
    /// worker if it is still around. Owned workers are reaped before
    /// returning.
    pub async fn retire(&self, mut record: ProcessRecord) {
        let slot = record.slot;

        match self.terminate(&record) {
            Ok(true) => info!("{}: sent stop signal to PID {}", slot, record.pid),
            Ok(false) => debug!("{}: PID {} was already gone", slot, record.pid),
            Err(e) => warn!("{}: {}", slot, e),
        }

        let mut deadline = Instant::now() + self.grace;
        let mut killed = false;
        loop {
            if self.is_alive(&mut record) == Liveness::Dead {
                break;
            }
            if Instant::now() >= deadline {
                if killed {
                    warn!("{}: PID {} did not exit after being killed", slot, record.pid);
                    break;
                }
                warn!(
                    "{}: PID {} still running after {:?}, killing it",
                    slot, record.pid, self.grace
                );
                if let Err(e) = self.kill(&record) {
                    warn!("{}: {}", slot, e);
                }
                killed = true;
                deadline = Instant::now() + KILL_WAIT;
            }
            tokio::time::sleep(RETIRE_POLL_INTERVAL).await;
        }

        self.forget(slot);
    }

    /// Removes the PID record of `slot`.
    pub fn forget(&self, slot: Slot) {
        if let Err(e) = self.records.clear(slot) {
            warn!("{}: failed to remove PID record: {}", slot, e);
        }
    }

    /// Name of the liveness probe in use.
    #[must_use]
    pub fn probe_name(&self) -> &'static str {
        self.probe.name()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("command", &self.command)
            .field("output", &self.output)
            .field("probe", &self.probe.name())
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

/// Opens the worker log for appending and returns its current length.
fn open_log(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.metadata()?.len();
    Ok((file, offset))
}

/// Copies lines appended to the worker log into the launcher log.
///
/// Runs until aborted; the worker never depends on it.
async fn follow_log(slot: Slot, path: PathBuf, offset: u64) {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            debug!("{}: cannot follow {}: {}", slot, path.display(), e);
            return;
        }
    };
    let mut reader = BufReader::new(file);
    if let Err(e) = reader.seek(SeekFrom::Start(offset)).await {
        debug!("{}: cannot follow {}: {}", slot, path.display(), e);
        return;
    }

    let mut line = String::new();
    loop {
        match reader.read_line(&mut line).await {
            Ok(_) if line.ends_with('\n') => {
                info!(slot = slot.index(), "{}", line.trim_end());
                line.clear();
            }
            // End of file, possibly in the middle of a line.
            Ok(_) => tokio::time::sleep(LOG_POLL_INTERVAL).await,
            Err(e) => {
                debug!("{}: stopped following {}: {}", slot, path.display(), e);
                break;
            }
        }
    }
}
