//! Worker process supervision.
//!
//! Spawns one process per configured slot, keeps PID records on disk,
//! checks liveness and stops workers whose configuration disappeared.

mod probe;
mod process;
mod record;
mod signal;

#[cfg(feature = "resource-probe")]
pub use probe::ResourceProbe;
pub use probe::{Liveness, LivenessProbe, ProbeError, SignalProbe, select_probe};
pub use process::{OutputMode, ProcessRecord, SpawnError, Supervisor, WORKER_LOG, WorkerCommand};
pub use record::PidRecordStore;
pub use signal::{SignalError, StopSignal, stop_process};
