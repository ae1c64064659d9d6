//! Configuration source: launcher environment layered with a `.env` file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Immutable view of the configuration variables at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Captures the current process environment.
    #[must_use]
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    /// Returns the value of `key` if it is set and non-empty.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Returns true if `key` is set to a non-empty value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates over every variable, including empty ones.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sets `key` unless it is already present.
    fn insert_missing(&mut self, key: String, value: String) {
        self.vars.entry(key).or_insert(value);
    }
}

impl FromIterator<(String, String)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().collect(),
        }
    }
}

/// Produces a fresh configuration snapshot on every call.
pub trait EnvSource: Send + Sync {
    /// Returns the variables as they are right now.
    fn snapshot(&self) -> EnvSnapshot;
}

/// Process environment captured at start-up, plus an optional `.env` file
/// that is re-read on every snapshot.
///
/// Variables from the process win over the file, so the file only fills
/// gaps. Removing a key from the file makes it disappear from the next
/// snapshot, which is how a running slot gets retired.
#[derive(Debug, Clone)]
pub struct LayeredEnv {
    base: EnvSnapshot,
    env_file: Option<PathBuf>,
}

impl LayeredEnv {
    /// Captures the process environment and remembers the settings file.
    #[must_use]
    pub fn capture(env_file: Option<PathBuf>) -> Self {
        Self::with_base(EnvSnapshot::from_process(), env_file)
    }

    /// Builds a layered source from an explicit base.
    #[must_use]
    pub const fn with_base(base: EnvSnapshot, env_file: Option<PathBuf>) -> Self {
        Self { base, env_file }
    }

    /// Returns the settings file path, if any.
    #[must_use]
    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }

    /// Returns true if the settings file exists on disk.
    #[must_use]
    pub fn env_file_exists(&self) -> bool {
        self.env_file.as_deref().is_some_and(Path::is_file)
    }
}

impl EnvSource for LayeredEnv {
    fn snapshot(&self) -> EnvSnapshot {
        let mut snapshot = self.base.clone();

        let Some(path) = self.env_file.as_deref() else {
            return snapshot;
        };

        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) => {
                debug!("Could not read env file ({}): {}", path.display(), e);
                return snapshot;
            }
        };

        for item in iter {
            match item {
                Ok((key, value)) => snapshot.insert_missing(key, value),
                Err(e) => {
                    warn!("Skipping malformed line in {}: {}", path.display(), e);
                }
            }
        }

        snapshot
    }
}
