//! The on-disk backup catalogue: listing, retention sweep, deletion.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;

use hearth_core::{BackupEntry, BACKUP_DIR_PREFIX};

use crate::error::{io_err, BackupError};

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Every `backup_*` directory under `root`, newest first.
///
/// A missing `root` is an empty catalogue. Age is the directory's creation
/// time where the platform records one, else its modification time; ties
/// fall back to the name, which embeds the timestamp.
pub fn list_backups(root: &Path) -> Result<Vec<BackupEntry>, BackupError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(root, e)),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_err(root, e))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.starts_with(BACKUP_DIR_PREFIX) {
            continue;
        }
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) if metadata.is_dir() => metadata,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping unreadable backup");
                continue;
            }
        };
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        backups.push(BackupEntry {
            size_bytes: dir_size(&path),
            name,
            path,
            created_at: DateTime::<Local>::from(created),
        });
    }

    backups.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });
    Ok(backups)
}

/// Delete every backup beyond the `keep` newest. `keep == 0` disables the
/// sweep. Individual deletion failures are logged and counted.
pub fn prune(root: &Path, keep: u32) -> Result<PruneReport, BackupError> {
    if keep == 0 {
        tracing::debug!("retention disabled");
        return Ok(PruneReport::default());
    }

    let backups = list_backups(root)?;
    let keep = keep as usize;
    let mut report = PruneReport {
        kept: backups.len().min(keep),
        ..Default::default()
    };

    for stale in backups.iter().skip(keep) {
        match fs::remove_dir_all(&stale.path) {
            Ok(()) => {
                report.deleted += 1;
                tracing::info!(backup = %stale.name, "old backup deleted");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(backup = %stale.name, error = %e, "old backup not deleted");
            }
        }
    }

    Ok(report)
}

/// Reject anything that is not a bare `backup_*` directory name.
pub fn validate_backup_name(name: &str) -> Result<(), BackupError> {
    let bad = name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || !name.starts_with(BACKUP_DIR_PREFIX)
        || name.len() == BACKUP_DIR_PREFIX.len();
    if bad {
        return Err(BackupError::InvalidBackupName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Remove `<root>/<name>`.
pub fn delete_backup(root: &Path, name: &str) -> Result<(), BackupError> {
    validate_backup_name(name)?;
    let path = root.join(name);
    if !path.is_dir() {
        return Err(BackupError::BackupNotFound {
            name: name.to_string(),
        });
    }
    fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
    tracing::info!(backup = %name, "backup deleted");
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| match entry.file_type() {
            Ok(t) if t.is_dir() => dir_size(&entry.path()),
            Ok(_) => entry.metadata().map(|m| m.len()).unwrap_or(0),
            Err(_) => 0,
        })
        .sum()
}
