//! Launcher control loop module.
//!
//! Resolves every slot, prepares its workspace, spawns its worker and keeps
//! reconciling on a fixed interval.

mod runner;
mod state;

pub use runner::{Launcher, LauncherMessage};
pub use state::{ReconcileReport, SlotState};
