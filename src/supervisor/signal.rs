//! Stop signals for worker processes.

use thiserror::Error;

/// How hard to ask a worker to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, or `taskkill` without `/F`.
    Graceful,
    /// SIGKILL, or `taskkill /F`.
    Force,
}

/// Errors that can occur while signalling a process.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("PID {0} is not a valid process identifier")]
    InvalidPid(u32),

    #[error("Failed to signal PID {pid}: {reason}")]
    Failed { pid: u32, reason: String },
}

/// Converts a PID to the Unix representation, rejecting 0 and overflow.
///
/// PID 0 and negative values address process groups, never a single worker.
#[cfg(unix)]
pub(super) fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Sends `signal` to `pid`.
///
/// Returns `Ok(false)` if the process no longer exists.
#[cfg(unix)]
pub fn stop_process(pid: u32, signal: StopSignal) -> Result<bool, SignalError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};

    let target = unix_pid(pid).ok_or(SignalError::InvalidPid(pid))?;
    let signal = match signal {
        StopSignal::Graceful => Signal::SIGTERM,
        StopSignal::Force => Signal::SIGKILL,
    };

    match kill(target, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(SignalError::Failed {
            pid,
            reason: e.to_string(),
        }),
    }
}

/// Sends `signal` to `pid`.
///
/// Returns `Ok(false)` if the process no longer exists.
#[cfg(not(unix))]
pub fn stop_process(pid: u32, signal: StopSignal) -> Result<bool, SignalError> {
    if pid == 0 {
        return Err(SignalError::InvalidPid(pid));
    }

    let mut cmd = std::process::Command::new("taskkill");
    if signal == StopSignal::Force {
        cmd.arg("/F");
    }
    let output = cmd
        .args(["/PID", &pid.to_string()])
        .output()
        .map_err(|e| SignalError::Failed {
            pid,
            reason: e.to_string(),
        })?;

    if output.status.success() {
        return Ok(true);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("not found") {
        Ok(false)
    } else {
        Err(SignalError::Failed {
            pid,
            reason: stderr.trim().to_owned(),
        })
    }
}
