//! `hearth init --exe <path> [--backup-dir <dir>] ...`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use hearth_core::config::{config_path_at, init_config_at, validate_backup};
use hearth_core::{BackupConfiguration, HostConfig, RunnerConfig};

use super::home_dir;

/// Write a starter config. An existing config is left untouched.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Path to the bedrock_server executable.
    #[arg(long)]
    pub exe: Option<PathBuf>,

    /// Extra arguments passed to the executable.
    #[arg(long = "arg", value_name = "ARG")]
    pub args: Vec<String>,

    /// Where backups are written.
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Minutes between scheduled backups.
    #[arg(long, default_value_t = 30)]
    pub frequency: u32,

    /// Backups kept by the retention sweep (0 keeps everything).
    #[arg(long, default_value_t = 10)]
    pub keep: u32,

    /// World directory, when it is not `<server>/worlds/<level-name>`.
    #[arg(long)]
    pub world: Option<PathBuf>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let path = config_path_at(&home);
        if path.exists() {
            println!("config already exists: {}", path.display());
            return Ok(());
        }

        let backup = BackupConfiguration {
            frequency_minutes: self.frequency,
            backup_directory: self.backup_dir.unwrap_or_default(),
            max_backups_to_keep: self.keep,
            world_path: self.world,
        };
        if !backup.backup_directory.as_os_str().is_empty() {
            validate_backup(&backup).context("invalid backup settings")?;
        }

        let config = HostConfig {
            runner: RunnerConfig {
                exe_path: self.exe.unwrap_or_default(),
                args: self.args,
                ..RunnerConfig::default()
            },
            backup,
        };
        let config = init_config_at(&home, config)
            .with_context(|| format!("failed to write {}", path.display()))?;

        println!("✓ Wrote {}", path.display());
        if config.runner.exe_path.as_os_str().is_empty() {
            println!("  runner.exe_path is empty; set it before `hearth daemon start`");
        }
        if config.backup.backup_directory.as_os_str().is_empty() {
            println!("  backup.backup_directory is empty; scheduled backups stay paused");
        }
        Ok(())
    }
}
