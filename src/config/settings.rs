//! Launcher settings and configuration errors.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{EnvSnapshot, KeyScheme, Slot};

/// Launcher-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherSettings {
    /// Naming convention of the per-slot keys.
    #[serde(default)]
    pub key_scheme: KeyScheme,

    /// Seconds between two monitoring ticks.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Seconds a retired worker gets to exit before it is killed.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Directory holding the shared assets, slot workspaces and PID records.
    pub base_dir: PathBuf,

    /// Program started for every slot.
    #[serde(default = "default_worker_program")]
    pub worker_program: String,

    /// Arguments placed before the per-slot positional values.
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,

    /// Shared directories imported as code, copied into each workspace.
    #[serde(default = "default_code_assets")]
    pub code_assets: Vec<String>,

    /// Shared data directories, linked into each workspace.
    #[serde(default = "default_data_assets")]
    pub data_assets: Vec<String>,

    /// Pipe worker output into the launcher log instead of inheriting stdio.
    #[serde(default)]
    pub capture_output: bool,
}

fn default_interval() -> u64 {
    30
}

fn default_grace() -> u64 {
    10
}

fn default_worker_program() -> String {
    "python3".to_owned()
}

fn default_worker_args() -> Vec<String> {
    vec!["-m".to_owned(), "pyUltroid".to_owned()]
}

fn default_code_assets() -> Vec<String> {
    ["plugins", "assistant", "addons"].map(str::to_owned).to_vec()
}

fn default_data_assets() -> Vec<String> {
    ["resources", "strings"].map(str::to_owned).to_vec()
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            key_scheme: KeyScheme::default(),
            interval_secs: default_interval(),
            grace_secs: default_grace(),
            base_dir: PathBuf::from("."),
            worker_program: default_worker_program(),
            worker_args: default_worker_args(),
            code_assets: default_code_assets(),
            data_assets: default_data_assets(),
            capture_output: false,
        }
    }
}

impl LauncherSettings {
    /// Creates settings from configuration variables with defaults.
    #[must_use]
    pub fn from_env_with_defaults(env: &EnvSnapshot) -> Self {
        let defaults = Self::default();

        Self {
            key_scheme: env
                .get("LAUNCHER_KEY_SCHEME")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.key_scheme),
            interval_secs: env
                .get("LAUNCHER_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.interval_secs),
            grace_secs: env
                .get("LAUNCHER_GRACE_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.grace_secs),
            base_dir: env
                .get("LAUNCHER_BASE_DIR")
                .map_or(defaults.base_dir, PathBuf::from),
            worker_program: env
                .get("WORKER_PROGRAM")
                .map_or(defaults.worker_program, str::to_owned),
            worker_args: env
                .get("WORKER_ARGS")
                .map_or(defaults.worker_args, |s| s.split_whitespace().map(str::to_owned).collect()),
            code_assets: env
                .get("LAUNCHER_CODE_ASSETS")
                .map_or(defaults.code_assets, |s| split_list(s, ',')),
            data_assets: env
                .get("LAUNCHER_DATA_ASSETS")
                .map_or(defaults.data_assets, |s| split_list(s, ',')),
            capture_output: defaults.capture_output,
        }
    }

    /// Checks values that would make the launcher misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "interval",
                reason: "must be at least one second".to_owned(),
            });
        }
        if self.worker_program.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "worker program",
                reason: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }

    /// Interval between monitoring ticks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Grace period granted to retired workers.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{slot}: missing {}", .missing.join(", "))]
    MissingKeys { slot: Slot, missing: Vec<String> },

    #[error("Invalid {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}
