//! Multi-Client Launcher Library
//!
//! Runs up to five independently configured userbot workers from one
//! codebase on a single host.
//!
//! This crate provides the core functionality for:
//! - Resolving per-slot configuration from the environment and `.env`
//! - Materializing an isolated workspace for every slot
//! - Spawning, probing and stopping worker processes
//! - Reconciling running workers against the live configuration

pub mod config;
pub mod launcher;
pub mod supervisor;
pub mod workspace;
