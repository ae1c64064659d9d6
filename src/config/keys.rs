//! Slot numbering and environment key naming.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::MAX_SLOTS;

/// One of the fixed instance positions managed by the launcher.
///
/// Slots are numbered from 1. The first slot reads unsuffixed keys
/// (`API_ID`), every other slot reads keys suffixed with `index - 1`
/// (`API_ID1` for slot 2, `API_ID4` for slot 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize")]
pub struct Slot(usize);

impl Slot {
    /// Creates a slot from a 1-based index.
    ///
    /// Returns `None` if the index is outside `1..=MAX_SLOTS`.
    #[must_use]
    pub const fn new(index: usize) -> Option<Self> {
        if index >= 1 && index <= MAX_SLOTS {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Returns every slot in ascending order.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=MAX_SLOTS).map(Self)
    }

    /// Returns the 1-based slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Returns the zero-based position, for indexing per-slot tables.
    #[must_use]
    pub const fn position(self) -> usize {
        self.0 - 1
    }

    /// Returns the key suffix for this slot.
    #[must_use]
    pub fn suffix(self) -> String {
        if self.0 == 1 {
            String::new()
        } else {
            (self.0 - 1).to_string()
        }
    }

    /// Returns `base` with this slot's suffix appended.
    #[must_use]
    pub fn key(self, base: &str) -> String {
        format!("{base}{}", self.suffix())
    }
}

impl TryFrom<usize> for Slot {
    type Error = String;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        Self::new(index).ok_or_else(|| format!("slot {index} is outside 1..={MAX_SLOTS}"))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client {}", self.0)
    }
}

/// Logical configuration keys understood by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    AccountId,
    AccountSecret,
    SessionToken,
    StorageUri,
    NotifyChannel,
    DeliveryToken,
}

impl ConfigKey {
    /// Keys that must all be present for a slot to start.
    pub const REQUIRED: [Self; 4] = [
        Self::AccountId,
        Self::AccountSecret,
        Self::SessionToken,
        Self::StorageUri,
    ];

    /// Keys forwarded to the worker when present.
    pub const OPTIONAL: [Self; 2] = [Self::NotifyChannel, Self::DeliveryToken];
}

/// Naming convention for the environment keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeyScheme {
    /// `ACCOUNT_ID`, `ACCOUNT_SECRET`, `SESSION_TOKEN`, `STORAGE_URI`, ...
    #[default]
    Generic,
    /// `API_ID`, `API_HASH`, `SESSION`, `MONGO_URI`, ... as used by Ultroid.
    Ultroid,
}

impl KeyScheme {
    /// Returns the unsuffixed environment name of `key`.
    #[must_use]
    pub const fn name(self, key: ConfigKey) -> &'static str {
        match (self, key) {
            (Self::Generic, ConfigKey::AccountId) => "ACCOUNT_ID",
            (Self::Generic, ConfigKey::AccountSecret) => "ACCOUNT_SECRET",
            (Self::Generic, ConfigKey::SessionToken) => "SESSION_TOKEN",
            (Self::Generic, ConfigKey::StorageUri) => "STORAGE_URI",
            (Self::Generic, ConfigKey::NotifyChannel) => "NOTIFY_CHANNEL",
            (Self::Generic, ConfigKey::DeliveryToken) => "DELIVERY_TOKEN",
            (Self::Ultroid, ConfigKey::AccountId) => "API_ID",
            (Self::Ultroid, ConfigKey::AccountSecret) => "API_HASH",
            (Self::Ultroid, ConfigKey::SessionToken) => "SESSION",
            (Self::Ultroid, ConfigKey::StorageUri) => "MONGO_URI",
            (Self::Ultroid, ConfigKey::NotifyChannel) => "LOG_CHANNEL",
            (Self::Ultroid, ConfigKey::DeliveryToken) => "BOT_TOKEN",
        }
    }

    /// Prefix of the per-slot storage namespace (`<prefix><slot>`).
    #[must_use]
    pub const fn namespace_prefix(self) -> &'static str {
        match self {
            Self::Generic => "NS",
            Self::Ultroid => "UltroidDB",
        }
    }

    /// Variable pointing the worker at its isolated session area.
    #[must_use]
    pub const fn session_dir_var(self) -> &'static str {
        match self {
            Self::Generic => "SESSION_DIR",
            Self::Ultroid => "TELEGRAM_SESSION_DIR",
        }
    }

    /// Variable that makes the shared code importable from a slot workspace.
    #[must_use]
    pub const fn code_path_var(self) -> Option<&'static str> {
        match self {
            Self::Generic => None,
            Self::Ultroid => Some("PYTHONPATH"),
        }
    }
}

impl fmt::Display for KeyScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => f.write_str("generic"),
            Self::Ultroid => f.write_str("ultroid"),
        }
    }
}

impl std::str::FromStr for KeyScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" => Ok(Self::Generic),
            "ultroid" => Ok(Self::Ultroid),
            other => Err(format!("unknown key scheme: {other}")),
        }
    }
}
