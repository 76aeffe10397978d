//! Size-based rotation for the daemon's log files and the console mirror.
//!
//! A file over 10 MiB is shifted to `<name>.1`; older copies move up one
//! slot and anything past `<name>.5` is dropped. The console mirror is
//! reopened per line, so renaming it underneath the supervisor is safe.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Maximum log file size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Rotated copies kept per file.
pub const MAX_ROTATED_FILES: usize = 5;

/// Rotate `log_path` once it reaches `max_bytes`.
///
/// Returns `Ok(false)` for small or missing files.
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    if size < max_bytes {
        return Ok(false);
    }

    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let from = numbered_path(log_path, n);
        if from.exists() {
            fs::rename(&from, numbered_path(log_path, n + 1))?;
        }
    }
    fs::rename(log_path, numbered_path(log_path, 1))?;

    // Leave an empty file behind for writers holding the path.
    fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(log_path)?;
    Ok(true)
}

/// Files the daemon keeps trimmed: `daemon.log`, `daemon-err.log` and the
/// console mirror.
pub fn rotated_files(home: &Path, console_log: &Path) -> Vec<PathBuf> {
    vec![
        crate::paths::stdout_log_path(home),
        crate::paths::stderr_log_path(home),
        console_log.to_path_buf(),
    ]
}

/// Rotate each of `paths`. A failure on one file is logged and the rest are
/// still processed.
pub fn rotate_logs(paths: &[PathBuf]) {
    for log_path in paths {
        match rotate_if_needed(log_path, MAX_LOG_BYTES, MAX_ROTATED_FILES) {
            Ok(true) => tracing::info!(path = %log_path.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(path = %log_path.display(), error = %err, "log rotation failed")
            }
        }
    }
}

/// `<base>.<n>`, e.g. `console.log.2`.
fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hearth.log".to_string());
    base.with_file_name(format!("{name}.{n}"))
}
