//! Putting a backup back in place of the live world.
//!
//! The current world is renamed to `<world>.pre-restore-<timestamp>` rather
//! than deleted, and renamed back if the copy fails.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::copy::{copy_tree, BACKUP_TIMESTAMP_FORMAT};
use crate::error::{io_err, BackupError};
use crate::retention::validate_backup_name;

/// What a successful restore did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub backup: String,
    pub world: PathBuf,
    pub files_restored: usize,
    /// Where the replaced world was moved, if there was one.
    pub previous_world: Option<PathBuf>,
}

/// Replace `world` with the contents of `<backup_root>/<name>`.
///
/// The caller must make sure the server is stopped.
pub fn restore_backup(
    backup_root: &Path,
    name: &str,
    world: &Path,
    at: DateTime<Local>,
) -> Result<RestoreReport, BackupError> {
    validate_backup_name(name)?;
    let source = backup_root.join(name);
    if !source.is_dir() {
        return Err(BackupError::BackupNotFound {
            name: name.to_string(),
        });
    }

    let previous_world = if world.exists() {
        let aside = aside_path(world, at);
        fs::rename(world, &aside).map_err(|e| io_err(world, e))?;
        tracing::info!(from = %world.display(), to = %aside.display(), "current world moved aside");
        Some(aside)
    } else {
        None
    };

    match copy_tree(&source, world) {
        Ok(files_restored) => {
            tracing::info!(backup = %name, files = files_restored, "backup restored");
            Ok(RestoreReport {
                backup: name.to_string(),
                world: world.to_path_buf(),
                files_restored,
                previous_world,
            })
        }
        Err(err) => {
            tracing::error!(backup = %name, error = %err, "restore failed, rolling back");
            if let Err(e) = fs::remove_dir_all(world) {
                tracing::warn!(path = %world.display(), error = %e, "partial world not removed");
            }
            if let Some(aside) = previous_world.as_deref() {
                if let Err(e) = fs::rename(aside, world) {
                    tracing::error!(
                        path = %aside.display(),
                        error = %e,
                        "previous world could not be moved back",
                    );
                }
            }
            Err(err)
        }
    }
}

fn aside_path(world: &Path, at: DateTime<Local>) -> PathBuf {
    let name = world
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "world".to_string());
    world.with_file_name(format!(
        "{name}.pre-restore-{}",
        at.format(BACKUP_TIMESTAMP_FORMAT)
    ))
}
