//! Per-slot workspace creation and repair.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::assets::{clear_stale_target, copy_dir, is_link, is_populated_dir, link_dir};
use crate::config::{Slot, SlotConfig};

/// Name of the isolated session area inside every workspace.
pub const SESSION_DIR: &str = "sessions";

/// Name of the environment file copied into every workspace.
pub const ENV_FILE_NAME: &str = ".env";

/// Errors that can occur while preparing a workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to prepare asset '{name}': {source}")]
    Asset {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// How a shared directory is made available to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetKind {
    /// Imported as code by the worker: copied, so replacing the shared tree
    /// never leaves a running worker without importable modules.
    Code,
    /// Plain data: linked, so updates to the shared tree show up live.
    Data,
}

/// Result of ensuring a single asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssetState {
    Present,
    Materialized,
    SourceMissing,
}

/// A prepared slot workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// Slot owning the workspace.
    pub slot: Slot,

    /// Workspace root, used as the worker's working directory.
    pub root: PathBuf,

    /// Isolated session area.
    pub session_dir: PathBuf,

    /// Shared assets that could not be provided.
    pub degraded: Vec<String>,
}

impl Workspace {
    /// Returns true if at least one shared asset is unavailable.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Where workspaces live and what goes into them.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    base_dir: PathBuf,
    env_file: Option<PathBuf>,
    code_assets: Vec<String>,
    data_assets: Vec<String>,
}

impl WorkspaceLayout {
    /// Creates a layout rooted at `base_dir`, which also holds the shared assets.
    ///
    /// A relative `base_dir` is made absolute so data asset links never point
    /// back into the workspace they live in.
    #[must_use]
    pub fn new(
        base_dir: PathBuf,
        env_file: Option<PathBuf>,
        code_assets: Vec<String>,
        data_assets: Vec<String>,
    ) -> Self {
        let keep = |name: &String| {
            let reserved = name == SESSION_DIR || name == ENV_FILE_NAME;
            if reserved {
                warn!("Ignoring shared asset '{}': the name is reserved", name);
            }
            !reserved
        };

        let base_dir = std::path::absolute(&base_dir).unwrap_or(base_dir);

        Self {
            base_dir,
            env_file,
            code_assets: code_assets.into_iter().filter(keep).collect(),
            data_assets: data_assets.into_iter().filter(keep).collect(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the workspace directory of `slot`.
    #[must_use]
    pub fn slot_dir(&self, slot: Slot) -> PathBuf {
        self.base_dir.join(format!("client_{}", slot.index()))
    }

    /// Creates or repairs the workspace of a configured slot.
    ///
    /// Safe to call on every launch: present assets are left alone, missing
    /// or emptied ones are restored and the session area is never touched
    /// beyond being created.
    pub fn ensure_workspace(&self, config: &SlotConfig) -> Result<Workspace, WorkspaceError> {
        let slot = config.slot;
        let root = self.slot_dir(slot);
        let session_dir = root.join(SESSION_DIR);

        for dir in [&root, &session_dir] {
            fs::create_dir_all(dir).map_err(|source| WorkspaceError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        let mut degraded = Vec::new();
        let assets = self
            .code_assets
            .iter()
            .map(|name| (name, AssetKind::Code))
            .chain(self.data_assets.iter().map(|name| (name, AssetKind::Data)));

        for (name, kind) in assets {
            match self.ensure_asset(&root, name, kind) {
                Ok(AssetState::Present) => {}
                Ok(AssetState::Materialized) => {
                    debug!("{}: prepared {} ({:?})", slot, name, kind);
                }
                Ok(AssetState::SourceMissing) => {
                    warn!("{}: shared asset '{}' is missing or empty", slot, name);
                    degraded.push(name.clone());
                }
                Err(source) => {
                    let err = WorkspaceError::Asset {
                        name: name.clone(),
                        source,
                    };
                    warn!("{}: {}", slot, err);
                    degraded.push(name.clone());
                }
            }
        }

        if let Err(e) = self.sync_env_file(&root) {
            warn!("{}: could not copy environment file: {}", slot, e);
            degraded.push(ENV_FILE_NAME.to_owned());
        }

        if !degraded.is_empty() {
            info!("{}: workspace degraded (unavailable: {})", slot, degraded.join(", "));
        }

        Ok(Workspace {
            slot,
            root,
            session_dir,
            degraded,
        })
    }

    fn ensure_asset(&self, root: &Path, name: &str, kind: AssetKind) -> io::Result<AssetState> {
        let source = self.base_dir.join(name);
        let target = root.join(name);

        if !is_populated_dir(&source) {
            return Ok(AssetState::SourceMissing);
        }

        match kind {
            AssetKind::Code => {
                if !is_link(&target) && is_populated_dir(&target) {
                    return Ok(AssetState::Present);
                }
                clear_stale_target(&target)?;
                copy_dir(&source, &target)?;
            }
            AssetKind::Data => {
                if is_populated_dir(&target) {
                    return Ok(AssetState::Present);
                }
                clear_stale_target(&target)?;
                link_dir(&source, &target)?;
            }
        }

        Ok(AssetState::Materialized)
    }

    /// Copies the environment file when the workspace copy is missing or stale.
    fn sync_env_file(&self, root: &Path) -> io::Result<()> {
        let Some(source) = self.env_file.as_deref().filter(|p| p.is_file()) else {
            return Ok(());
        };
        let target = root.join(ENV_FILE_NAME);

        let modified = |path: &Path| fs::metadata(path).and_then(|m| m.modified()).ok();
        let stale = match (modified(source), modified(&target)) {
            (_, None) => true,
            (Some(src), Some(dst)) => src > dst,
            (None, Some(_)) => false,
        };

        if stale {
            fs::copy(source, &target)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::{EnvSnapshot, KeyScheme, resolve};

    fn config(slot: usize) -> SlotConfig {
        let suffix = if slot == 1 { String::new() } else { (slot - 1).to_string() };
        let env: EnvSnapshot = [
            ("ACCOUNT_ID", "1"),
            ("ACCOUNT_SECRET", "secret"),
            ("SESSION_TOKEN", "token"),
            ("STORAGE_URI", "proto://host"),
        ]
        .iter()
        .map(|(k, v)| (format!("{k}{suffix}"), (*v).to_owned()))
        .collect();
        resolve(Slot::new(slot).unwrap(), KeyScheme::Generic, &env)
            .into_result()
            .unwrap()
    }

    fn shared_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        fs::create_dir_all(base.join("plugins")).unwrap();
        fs::write(base.join("plugins/admin.py"), "print('admin')").unwrap();
        fs::create_dir_all(base.join("resources")).unwrap();
        fs::write(base.join("resources/logo.png"), "png").unwrap();
        fs::write(base.join(".env"), "ACCOUNT_ID=1\n").unwrap();
        tmp
    }

    fn layout(base: &Path) -> WorkspaceLayout {
        WorkspaceLayout::new(
            base.to_path_buf(),
            Some(base.join(".env")),
            vec!["plugins".to_owned()],
            vec!["resources".to_owned()],
        )
    }

    #[test]
    fn test_first_call_materializes_workspace() {
        let tmp = shared_tree();
        let workspace = layout(tmp.path()).ensure_workspace(&config(2)).unwrap();

        assert_eq!(workspace.root, tmp.path().join("client_2"));
        assert!(workspace.session_dir.is_dir());
        assert!(workspace.root.join("plugins/admin.py").is_file());
        assert!(!is_link(&workspace.root.join("plugins")));
        assert!(workspace.root.join("resources/logo.png").is_file());
        assert!(workspace.root.join(".env").is_file());
        assert!(!workspace.is_degraded());
    }

    #[cfg(unix)]
    #[test]
    fn test_data_assets_are_linked() {
        let tmp = shared_tree();
        let workspace = layout(tmp.path()).ensure_workspace(&config(1)).unwrap();
        assert!(is_link(&workspace.root.join("resources")));

        fs::write(tmp.path().join("resources/new.txt"), "live").unwrap();
        assert!(workspace.root.join("resources/new.txt").is_file());
    }

    #[test]
    fn test_second_call_is_idempotent_and_keeps_sessions() {
        let tmp = shared_tree();
        let layout = layout(tmp.path());
        let first = layout.ensure_workspace(&config(3)).unwrap();
        fs::write(first.session_dir.join("client.session"), "secret").unwrap();

        let second = layout.ensure_workspace(&config(3)).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            fs::read_to_string(second.session_dir.join("client.session")).unwrap(),
            "secret"
        );
        let mut names: Vec<String> = fs::read_dir(&second.root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![".env", "plugins", "resources", "sessions"]);
    }

    #[test]
    fn test_emptied_code_asset_is_recopied() {
        let tmp = shared_tree();
        let layout = layout(tmp.path());
        let workspace = layout.ensure_workspace(&config(1)).unwrap();

        fs::remove_file(workspace.root.join("plugins/admin.py")).unwrap();
        layout.ensure_workspace(&config(1)).unwrap();

        assert!(workspace.root.join("plugins/admin.py").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_link_is_repaired() {
        let tmp = shared_tree();
        let layout = layout(tmp.path());
        let workspace = layout.ensure_workspace(&config(1)).unwrap();
        let link = workspace.root.join("resources");

        fs::remove_file(&link).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone"), &link).unwrap();
        layout.ensure_workspace(&config(1)).unwrap();

        assert!(link.join("logo.png").is_file());
    }

    #[test]
    fn test_missing_source_degrades_without_failing() {
        let tmp = shared_tree();
        let layout = WorkspaceLayout::new(
            tmp.path().to_path_buf(),
            None,
            vec!["plugins".to_owned(), "addons".to_owned()],
            vec!["strings".to_owned()],
        );

        let workspace = layout.ensure_workspace(&config(4)).unwrap();

        assert_eq!(workspace.degraded, vec!["addons", "strings"]);
        assert!(workspace.root.join("plugins/admin.py").is_file());
        assert!(!workspace.root.join(".env").exists());
    }

    #[test]
    fn test_relative_base_dir_is_made_absolute() {
        let layout = WorkspaceLayout::new(PathBuf::from("."), None, vec![], vec![]);
        let cwd = std::env::current_dir().unwrap();

        assert!(layout.base_dir().is_absolute());
        assert!(layout.slot_dir(Slot::new(2).unwrap()).starts_with(&cwd));
    }

    #[test]
    fn test_reserved_names_are_not_assets() {
        let tmp = shared_tree();
        let layout = WorkspaceLayout::new(
            tmp.path().to_path_buf(),
            None,
            vec![SESSION_DIR.to_owned()],
            vec![ENV_FILE_NAME.to_owned()],
        );
        let workspace = layout.ensure_workspace(&config(1)).unwrap();
        assert!(!workspace.is_degraded());
    }
}
