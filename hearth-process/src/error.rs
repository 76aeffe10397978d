use std::path::PathBuf;

use thiserror::Error;

/// Failures of the supervised child process and its command channel.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("server executable not found: {path}")]
    ExecutableNotFound { path: PathBuf },

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("server process is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("server process is not running")]
    NotRunning,

    #[error("failed to send '{line}' to the server: {source}")]
    CommandSendFailed {
        line: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no previous launch to restart")]
    NeverStarted,
}
