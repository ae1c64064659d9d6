//! Configuration module for the launcher.
//!
//! Handles the configuration source (environment plus `.env` file),
//! per-slot key resolution, storage namespace derivation and the
//! launcher's own settings.

mod env;
mod keys;
mod resolver;
mod settings;

pub use env::{EnvSnapshot, EnvSource, LayeredEnv};
pub use keys::{ConfigKey, KeyScheme, Slot};
pub use resolver::{Resolution, SlotConfig, resolve, rewrite_storage_uri};
pub use settings::{ConfigError, LauncherSettings};

/// Highest number of slots the launcher manages.
pub const MAX_SLOTS: usize = 5;
