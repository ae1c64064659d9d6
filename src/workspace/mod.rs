//! Isolated per-slot workspaces.
//!
//! Every slot runs inside its own directory with private session storage,
//! copied code assets and linked data assets.

mod assets;
mod materializer;

pub use materializer::{ENV_FILE_NAME, SESSION_DIR, Workspace, WorkspaceError, WorkspaceLayout};
