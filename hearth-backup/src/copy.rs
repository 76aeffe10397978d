//! Backup directory creation and file copying.
//!
//! Everything here is blocking `std::fs` work; the coordinator runs it on
//! the blocking pool.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Local};

use hearth_core::BACKUP_DIR_PREFIX;

use crate::error::{io_err, BackupError};

/// `strftime` pattern for the timestamp part of a backup directory name.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Counts from one copy pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub copied: usize,
    pub failed: usize,
}

/// `backup_<yyyy-MM-dd_HH-mm-ss>` for `at`.
pub fn backup_dir_name(at: DateTime<Local>) -> String {
    format!("{BACKUP_DIR_PREFIX}{}", at.format(BACKUP_TIMESTAMP_FORMAT))
}

/// Create `<root>/backup_<timestamp>`, creating `root` as needed.
///
/// Two runs in the same second get `_2`, `_3`, ... suffixes instead of
/// sharing a directory.
pub fn create_backup_dir(root: &Path, at: DateTime<Local>) -> Result<PathBuf, BackupError> {
    let create_failure = |path: &Path, source| BackupError::DirectoryCreateFailure {
        path: path.to_path_buf(),
        source,
    };

    fs::create_dir_all(root).map_err(|e| create_failure(root, e))?;

    let base = backup_dir_name(at);
    let mut attempt = 1usize;
    loop {
        let name = if attempt == 1 {
            base.clone()
        } else {
            format!("{base}_{attempt}")
        };
        let candidate = root.join(name);
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(create_failure(&candidate, e)),
        }
    }
}

/// Copy each manifest path from `world` into `dest`, mirroring directories.
///
/// Missing sources and copy errors are counted and logged; the pass always
/// visits every entry. Existing destination files are overwritten.
pub fn copy_world_files(world: &Path, dest: &Path, files: &[String]) -> CopyReport {
    let mut report = CopyReport::default();

    for relative in files {
        match copy_one(world, dest, relative) {
            Ok(()) => report.copied += 1,
            Err(err) => {
                report.failed += 1;
                tracing::warn!(file = %relative, error = %err, "backup file not copied");
            }
        }
    }

    tracing::debug!(copied = report.copied, failed = report.failed, "copy pass finished");
    report
}

fn copy_one(world: &Path, dest: &Path, relative: &str) -> Result<(), BackupError> {
    let relative_path = Path::new(relative);
    if !is_contained(relative_path) {
        return Err(io_err(
            relative_path,
            std::io::Error::new(ErrorKind::InvalidInput, "path escapes the world directory"),
        ));
    }

    let source = world.join(relative_path);
    if !source.is_file() {
        return Err(io_err(
            &source,
            std::io::Error::new(ErrorKind::NotFound, "source file missing"),
        ));
    }

    let target = dest.join(relative_path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    fs::copy(&source, &target).map_err(|e| io_err(&target, e))?;
    Ok(())
}

/// Only plain relative components; no `..`, roots or prefixes.
fn is_contained(relative: &Path) -> bool {
    relative.components().next().is_some()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Recursively copy the directory tree at `from` into `to`. Returns the
/// number of files copied.
pub(crate) fn copy_tree(from: &Path, to: &Path) -> Result<usize, BackupError> {
    fs::create_dir_all(to).map_err(|e| io_err(to, e))?;
    let mut copied = 0;
    for entry in fs::read_dir(from).map_err(|e| io_err(from, e))? {
        let entry = entry.map_err(|e| io_err(from, e))?;
        let path = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            copied += copy_tree(&path, &target)?;
        } else if file_type.is_file() {
            fs::copy(&path, &target).map_err(|e| io_err(&target, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
