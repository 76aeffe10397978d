//! Domain types shared across the Hearth workspace.
//!
//! All path fields use `PathBuf`. Configuration types are (de)serializable via
//! serde + serde_yaml; status types serialize to JSON for the control socket.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Level name used when `server.properties` cannot supply one.
pub const DEFAULT_LEVEL_NAME: &str = "Bedrock level";

/// Every backup directory name starts with this prefix.
pub const BACKUP_DIR_PREFIX: &str = "backup_";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduling, location and retention settings for world backups.
///
/// Hot-reloadable: the daemon publishes every validated change and the
/// backup loop reads the current value on each iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfiguration {
    pub frequency_minutes: u32,
    pub backup_directory: PathBuf,
    pub max_backups_to_keep: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_path: Option<PathBuf>,
}

impl Default for BackupConfiguration {
    fn default() -> Self {
        Self {
            frequency_minutes: 30,
            backup_directory: PathBuf::new(),
            max_backups_to_keep: 10,
            world_path: None,
        }
    }
}

impl BackupConfiguration {
    /// `true` when the scheduler has enough to run: a directory and a
    /// frequency of at least one minute.
    pub fn is_schedulable(&self) -> bool {
        self.frequency_minutes >= 1 && !self.backup_directory.as_os_str().is_empty()
    }
}

/// How to launch the supervised server executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub exe_path: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Defaults to the executable's parent directory.
    pub working_dir: Option<PathBuf>,
    /// Mirror file for console output. Defaults to `~/.hearth/logs/console.log`.
    pub console_log: Option<PathBuf>,
    pub stop_grace_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            exe_path: PathBuf::new(),
            args: Vec::new(),
            working_dir: None,
            console_log: None,
            stop_grace_secs: 5,
        }
    }
}

impl RunnerConfig {
    /// Working directory for the child: explicit setting, else the
    /// executable's directory.
    pub fn effective_working_dir(&self) -> Option<PathBuf> {
        self.working_dir
            .clone()
            .or_else(|| self.exe_path.parent().map(PathBuf::from))
            .filter(|dir| !dir.as_os_str().is_empty())
    }
}

/// Root of `~/.hearth/config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub backup: BackupConfiguration,
}

// ---------------------------------------------------------------------------
// Process status
// ---------------------------------------------------------------------------

/// Lifecycle state of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    #[default]
    NotStarted,
    Running,
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::NotStarted => write!(f, "not started"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited => write!(f, "exited"),
        }
    }
}

/// Point-in-time view of the supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProcessStatus {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub exit_code: Option<i32>,
    pub memory_rss_bytes: Option<u64>,
    pub log_lines: usize,
    pub log_bytes: usize,
}

impl ProcessStatus {
    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }
}

// ---------------------------------------------------------------------------
// Backup catalogue
// ---------------------------------------------------------------------------

/// One `backup_*` directory on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Local>,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
