//! Filesystem helpers for shared asset directories.

use std::fs;
use std::io;
use std::path::Path;

/// Returns true if `path` is a symbolic link (dangling or not).
pub(super) fn is_link(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

/// Returns true if `path` resolves to a directory with at least one entry.
pub(super) fn is_populated_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_some())
}

/// Removes whatever sits at `target` if it is a link or an empty directory.
///
/// Anything else is left alone and reported as a conflict.
pub(super) fn clear_stale_target(target: &Path) -> io::Result<()> {
    let Ok(meta) = fs::symlink_metadata(target) else {
        return Ok(());
    };

    if meta.file_type().is_symlink() {
        remove_link(target)
    } else if meta.is_dir() && !is_populated_dir(target) {
        fs::remove_dir(target)
    } else if meta.is_dir() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", target.display()),
        ))
    }
}

#[cfg(unix)]
fn remove_link(target: &Path) -> io::Result<()> {
    fs::remove_file(target)
}

#[cfg(not(unix))]
fn remove_link(target: &Path) -> io::Result<()> {
    // Directory symlinks and junctions are removed as directories on Windows.
    fs::remove_dir(target).or_else(|_| fs::remove_file(target))
}

/// Copies `source` into `target`, replacing nothing that already exists.
///
/// The tree is first copied next to the target and then renamed into place,
/// so an interrupted copy never looks like a complete one.
pub(super) fn copy_dir(source: &Path, target: &Path) -> io::Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = target.with_file_name(format!(".{file_name}.partial"));

    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    copy_tree(source, &staging)?;
    fs::rename(&staging, target)
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());

        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }

    Ok(())
}

/// Links `target` to `source`, copying where links are unavailable.
#[cfg(unix)]
pub(super) fn link_dir(source: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(not(unix))]
pub(super) fn link_dir(source: &Path, target: &Path) -> io::Result<()> {
    copy_dir(source, target)
}
