//! Error types for hearth-backup.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong during a backup run or a catalogue operation.
///
/// Failures inside a protocol run never propagate out of it; they end up in
/// [`BackupRun::outcome`](crate::BackupRun::outcome) and the log.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("server process is not running")]
    ProcessNotRunning,

    #[error("failed to send '{command}' to the server")]
    CommandSendFailed { command: String },

    #[error("no save-ready marker within {}s of save query", waited.as_secs())]
    SaveQuerySignalTimeout { waited: Duration },

    #[error("no manifest line for level '{level}' in the console log")]
    ManifestEmpty { level: String },

    /// Non-fatal: the run still counts as a partial success.
    #[error("{failed} file(s) could not be copied ({copied} copied)")]
    PartialCopyFailure { copied: usize, failed: usize },

    #[error("cannot create backup directory {path}: {source}")]
    DirectoryCreateFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Non-fatal: the sweep continues past individual failures.
    #[error("retention sweep could not delete {failed} backup(s)")]
    RetentionSweepPartialFailure { failed: usize },

    #[error("no files were copied ({failed} failed)")]
    NoFilesCopied { failed: usize },

    #[error("backup cancelled by shutdown")]
    Cancelled,

    #[error("a backup is already in progress")]
    AlreadyRunning,

    #[error("stop the server before restoring a backup")]
    ServerRunning,

    #[error("backup '{name}' not found")]
    BackupNotFound { name: String },

    #[error("invalid backup name '{name}'")]
    InvalidBackupName { name: String },

    #[error("backups are not configured: {0}")]
    NotConfigured(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Convenience constructor for [`BackupError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> BackupError {
    BackupError::Io {
        path: path.into(),
        source,
    }
}
