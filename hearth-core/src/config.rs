//! Host configuration stored as YAML.
//!
//! # Storage layout
//!
//! ```text
//! ~/.hearth/
//!   config.yaml   (mode 0600, created by `hearth init`)
//! ```
//!
//! # API pattern
//!
//! Every function that touches disk has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`

use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::types::{BackupConfiguration, HostConfig};

/// Upper bound accepted for `frequency_minutes` when validating (one day).
pub const MAX_FREQUENCY_MINUTES: u32 = 1440;

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.hearth/`
pub fn hearth_root(home: &Path) -> PathBuf {
    home.join(".hearth")
}

/// `<home>/.hearth/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    hearth_root(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load the config from `<home>/.hearth/config.yaml`.
///
/// Returns `CoreError::ConfigNotFound` if absent,
/// `CoreError::Parse` (with path + line context) if malformed YAML.
pub fn load_config_at(home: &Path) -> Result<HostConfig, CoreError> {
    load_config_file(&config_path_at(home))
}

/// `load_config_at` convenience wrapper.
pub fn load_config() -> Result<HostConfig, CoreError> {
    load_config_at(&home()?)
}

/// Load a config from an explicit file path.
pub fn load_config_file(path: &Path) -> Result<HostConfig, CoreError> {
    if !path.exists() {
        return Err(CoreError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&contents).map_err(|e| CoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the config to `<home>/.hearth/config.yaml`.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_config_at(home: &Path, config: &HostConfig) -> Result<(), CoreError> {
    let root = hearth_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_config_at` convenience wrapper.
pub fn save_config(config: &HostConfig) -> Result<(), CoreError> {
    save_config_at(&home()?, config)
}

/// Write a fresh config if none exists.
///
/// Idempotent: an existing file is loaded and returned unchanged.
pub fn init_config_at(home: &Path, config: HostConfig) -> Result<HostConfig, CoreError> {
    let path = config_path_at(home);
    if path.exists() {
        return load_config_at(home);
    }
    save_config_at(home, &config)?;
    Ok(config)
}

/// Replace only the `backup` section, validating it first.
pub fn update_backup_config_at(
    home: &Path,
    backup: BackupConfiguration,
) -> Result<HostConfig, CoreError> {
    validate_backup(&backup)?;
    let mut config = load_config_at(home)?;
    config.backup = backup;
    save_config_at(home, &config)?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// 4. Validation
// ---------------------------------------------------------------------------

/// Reject backup settings that the scheduler cannot honour.
pub fn validate_backup(backup: &BackupConfiguration) -> Result<(), CoreError> {
    if backup.frequency_minutes < 1 || backup.frequency_minutes > MAX_FREQUENCY_MINUTES {
        return Err(CoreError::InvalidConfig(format!(
            "frequency_minutes must be between 1 and {MAX_FREQUENCY_MINUTES}, got {}",
            backup.frequency_minutes
        )));
    }
    if backup.backup_directory.as_os_str().is_empty() {
        return Err(CoreError::InvalidConfig(
            "backup_directory is required".to_string(),
        ));
    }
    Ok(())
}

/// Fatal-at-startup check: the daemon cannot run without an executable.
pub fn validate_runner(config: &HostConfig) -> Result<(), CoreError> {
    if config.runner.exe_path.as_os_str().is_empty() {
        return Err(CoreError::InvalidConfig(
            "runner.exe_path is not set".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
