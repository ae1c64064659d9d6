//! Per-slot launcher state.

use crate::config::Slot;
use crate::supervisor::ProcessRecord;

/// State of one slot between two monitoring ticks.
#[derive(Debug)]
pub enum SlotState {
    /// Not running. `missing` lists the keys that kept it from starting;
    /// it is empty for a configured slot whose worker exited or failed to
    /// start and will be retried on the next tick.
    Unconfigured { missing: Vec<String> },

    /// A worker is running for the slot.
    Running(ProcessRecord),
}

impl Default for SlotState {
    fn default() -> Self {
        Self::Unconfigured {
            missing: Vec::new(),
        }
    }
}

impl SlotState {
    /// Returns true if a worker is tracked for the slot.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    /// Returns the PID of the tracked worker.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        match self {
            Self::Running(record) => Some(record.pid),
            Self::Unconfigured { .. } => None,
        }
    }

    /// Returns the keys that were missing on the last resolution.
    #[must_use]
    pub fn missing(&self) -> &[String] {
        match self {
            Self::Unconfigured { missing } => missing,
            Self::Running(_) => &[],
        }
    }
}

/// What one pass over the slots changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Slots whose worker was spawned.
    pub started: Vec<Slot>,
    /// Slots whose worker from an earlier run was taken over.
    pub adopted: Vec<Slot>,
    /// Slots whose worker was stopped because the configuration vanished.
    pub stopped: Vec<Slot>,
    /// Slots whose worker was found dead.
    pub exited: Vec<Slot>,
    /// Configured slots that could not be started.
    pub failed: Vec<Slot>,
    /// Workers running once the pass finished.
    pub running: usize,
}

impl ReconcileReport {
    /// Returns true if no worker is running after the pass.
    ///
    /// After the first pass this means the launcher has nothing to watch
    /// and should exit with a failure status.
    #[must_use]
    pub const fn nothing_running(&self) -> bool {
        self.running == 0
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.adopted.is_empty()
            && self.stopped.is_empty()
            && self.exited.is_empty()
            && self.failed.is_empty()
    }
}
