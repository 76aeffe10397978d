//! Hearth core library — domain types, host configuration, server properties.
//!
//! - [`types`] — configuration and status structs shared by every crate
//! - [`config`] — load / save / validate `~/.hearth/config.yaml`
//! - [`properties`] — level-name lookup and world path resolution
//! - [`error`] — [`CoreError`]

pub mod config;
pub mod error;
pub mod properties;
pub mod types;

pub use error::CoreError;
pub use properties::{resolve_world_path, server_dir, LevelNameResolver};
pub use types::{
    BackupConfiguration, BackupEntry, HostConfig, ProcessState, ProcessStatus, RunnerConfig,
    BACKUP_DIR_PREFIX, DEFAULT_LEVEL_NAME,
};
