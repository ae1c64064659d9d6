//! On-disk PID records, one file per slot.
//!
//! The records let a restarted launcher find workers started by a previous
//! run, so it can adopt them or stop them once their configuration is gone.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;

use crate::config::Slot;

/// Directory of `client_<N>.pid` files.
#[derive(Debug, Clone)]
pub struct PidRecordStore {
    dir: PathBuf,
}

impl PidRecordStore {
    /// Creates a store writing into `dir`.
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Returns the record directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the record file of `slot`.
    #[must_use]
    pub fn path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("client_{}.pid", slot.index()))
    }

    /// Loads the PID recorded for `slot`.
    ///
    /// Returns `None` if there is no record or it does not hold a PID.
    #[must_use]
    pub fn load(&self, slot: Slot) -> Option<u32> {
        let path = self.path(slot);
        let content = fs::read_to_string(&path).ok()?;

        match content.trim().parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                warn!("Ignoring unreadable PID record {}", path.display());
                None
            }
        }
    }

    /// Returns when the record of `slot` was last written.
    #[must_use]
    pub fn written_at(&self, slot: Slot) -> Option<SystemTime> {
        fs::metadata(self.path(slot)).and_then(|m| m.modified()).ok()
    }

    /// Records `pid` for `slot`, replacing any previous record.
    pub fn save(&self, slot: Slot, pid: u32) -> io::Result<()> {
        fs::write(self.path(slot), pid.to_string())
    }

    /// Removes the record of `slot`.
    ///
    /// Returns `false` if there was nothing to remove.
    pub fn clear(&self, slot: Slot) -> io::Result<bool> {
        match fs::remove_file(self.path(slot)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lists every slot that has a readable record.
    #[must_use]
    pub fn tracked(&self) -> Vec<(Slot, u32)> {
        Slot::all()
            .filter_map(|slot| self.load(slot).map(|pid| (slot, pid)))
            .collect()
    }
}
