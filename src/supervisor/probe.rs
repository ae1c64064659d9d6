//! Liveness probes for worker processes the launcher did not spawn itself.
//!
//! A probe is selected once at start-up. The signal probe works everywhere;
//! the resource probe (feature `resource-probe`) also reports memory and CPU
//! usage and recognises zombies.
//!
//! Probes can also tell whether a PID runs inside a given workspace, which
//! keeps a reused PID from being mistaken for a worker of an earlier run.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Observed state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe failed; never treated as dead.
    Unknown,
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => f.write_str("alive"),
            Self::Dead => f.write_str("dead"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Errors raised by a liveness probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("PID {0} is not a valid process identifier")]
    InvalidPid(u32),

    #[error("Probe for PID {pid} failed: {reason}")]
    Failed { pid: u32, reason: String },
}

/// Answers "does this PID still belong to a live process".
pub trait LivenessProbe: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Returns whether `pid` is alive.
    fn probe(&self, pid: u32) -> Result<bool, ProbeError>;

    /// Like [`probe`](Self::probe), mapping failures to [`Liveness::Unknown`].
    fn liveness(&self, pid: u32) -> Liveness {
        match self.probe(pid) {
            Ok(true) => Liveness::Alive,
            Ok(false) => Liveness::Dead,
            Err(e) => {
                debug!("{}", e);
                Liveness::Unknown
            }
        }
    }

    /// Returns whether `pid` has `workspace` as its working directory.
    ///
    /// `None` means the probe cannot tell.
    fn runs_in(&self, pid: u32, workspace: &Path) -> Option<bool> {
        let _ = (pid, workspace);
        None
    }
}

/// Compares two directories, resolving links where possible.
#[cfg_attr(
    not(any(target_os = "linux", feature = "resource-probe")),
    allow(dead_code)
)]
fn same_dir(actual: &Path, expected: &Path) -> bool {
    let expected = std::fs::canonicalize(expected).unwrap_or_else(|_| expected.to_path_buf());
    let actual = std::fs::canonicalize(actual).unwrap_or_else(|_| actual.to_path_buf());
    actual == expected
}

/// Probe based on signal 0 (Unix) or `tasklist` (Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

#[cfg(unix)]
impl LivenessProbe for SignalProbe {
    fn name(&self) -> &'static str {
        "signal"
    }

    fn probe(&self, pid: u32) -> Result<bool, ProbeError> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let pid_raw = super::signal::unix_pid(pid).ok_or(ProbeError::InvalidPid(pid))?;

        match kill(pid_raw, None) {
            // EPERM: the process exists but belongs to someone else.
            Ok(()) | Err(Errno::EPERM) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(ProbeError::Failed {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    #[cfg(target_os = "linux")]
    fn runs_in(&self, pid: u32, workspace: &Path) -> Option<bool> {
        match std::fs::read_link(format!("/proc/{pid}/cwd")) {
            Ok(cwd) => Some(same_dir(&cwd, workspace)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(false),
            Err(e) => {
                debug!("Cannot read working directory of PID {}: {}", pid, e);
                None
            }
        }
    }
}

#[cfg(not(unix))]
impl LivenessProbe for SignalProbe {
    fn name(&self) -> &'static str {
        "tasklist"
    }

    fn probe(&self, pid: u32) -> Result<bool, ProbeError> {
        if pid == 0 {
            return Err(ProbeError::InvalidPid(pid));
        }

        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .output()
            .map_err(|e| ProbeError::Failed {
                pid,
                reason: e.to_string(),
            })?;

        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing.contains(&format!("\"{pid}\"")))
    }
}

/// Probe backed by `sysinfo`, logging resource usage of live workers.
#[cfg(feature = "resource-probe")]
#[derive(Debug)]
pub struct ResourceProbe {
    system: std::sync::Mutex<sysinfo::System>,
}

#[cfg(feature = "resource-probe")]
impl ResourceProbe {
    /// Creates a probe with an empty process table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(sysinfo::System::new()),
        }
    }
}

#[cfg(feature = "resource-probe")]
impl Default for ResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "resource-probe")]
impl LivenessProbe for ResourceProbe {
    fn name(&self) -> &'static str {
        "resource"
    }

    fn probe(&self, pid: u32) -> Result<bool, ProbeError> {
        use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate};

        let mut system = self.system.lock().map_err(|_| ProbeError::Failed {
            pid,
            reason: "process table lock poisoned".to_owned(),
        })?;

        let target = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

        match system.process(target) {
            None => Ok(false),
            Some(process) if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) => {
                Ok(false)
            }
            Some(process) => {
                debug!(
                    pid,
                    memory_kib = process.memory() / 1024,
                    cpu_percent = f64::from(process.cpu_usage()),
                    "Worker resource usage"
                );
                Ok(true)
            }
        }
    }

    fn runs_in(&self, pid: u32, workspace: &Path) -> Option<bool> {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, UpdateKind};

        let mut system = self.system.lock().ok()?;
        let target = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing().with_cwd(UpdateKind::Always),
        );

        match system.process(target) {
            None => Some(false),
            Some(process) => process.cwd().map(|cwd| same_dir(cwd, workspace)),
        }
    }
}

/// Picks the best probe available on this host.
#[must_use]
pub fn select_probe() -> Box<dyn LivenessProbe> {
    #[cfg(feature = "resource-probe")]
    {
        if sysinfo::IS_SUPPORTED_SYSTEM {
            return Box::new(ResourceProbe::new());
        }
        debug!("sysinfo does not support this system, using the signal probe");
    }

    Box::new(SignalProbe)
}
