//! `hearth backup` — manual trigger, catalogue and settings.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use hearth_backup::list_backups;
use hearth_core::config::{load_config_at, update_backup_config_at};
use hearth_core::BackupEntry;
use hearth_daemon::{request_backup, request_for_backup};

use super::{home_dir, print_json};

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Run a backup now through the daemon.
    Now,
    /// List backups in the configured directory, newest first.
    List(ListArgs),
    /// Delete one backup.
    Delete {
        /// Backup directory name, e.g. backup_2024-05-01_12-00-00.
        name: String,
    },
    /// Replace the live world with a backup. The server is stopped and
    /// started again around the restore.
    Restore {
        /// Backup directory name.
        name: String,
    },
    /// Show or change backup settings.
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Minutes between scheduled backups (1-1440).
    #[arg(long)]
    pub frequency: Option<u32>,

    /// Backup directory.
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Backups kept by the retention sweep (0 keeps everything).
    #[arg(long)]
    pub keep: Option<u32>,

    /// World directory override.
    #[arg(long)]
    pub world: Option<PathBuf>,
}

impl ConfigArgs {
    fn is_update(&self) -> bool {
        self.frequency.is_some() || self.dir.is_some() || self.keep.is_some() || self.world.is_some()
    }
}

#[derive(Tabled)]
struct BackupRow {
    #[tabled(rename = "backup")]
    name: String,
    #[tabled(rename = "created")]
    created: String,
    #[tabled(rename = "size")]
    size: String,
}

pub fn run(command: BackupCommand) -> Result<()> {
    let home = home_dir()?;

    match command {
        BackupCommand::Now => {
            let data = request_backup(&home).context("failed to trigger backup")?;
            report_run(&data)?;
        }
        BackupCommand::List(args) => {
            let config = load_config_at(&home)
                .context("failed to load config — run `hearth init` first")?;
            let root = config.backup.backup_directory;
            if root.as_os_str().is_empty() {
                bail!("backup.backup_directory is not set");
            }
            let backups = list_backups(&root)
                .with_context(|| format!("failed to list {}", root.display()))?;
            if args.json {
                print_json(&serde_json::to_value(&backups).context("failed to encode backups")?)?;
            } else {
                print_backups(&root, backups);
            }
        }
        BackupCommand::Delete { name } => {
            request_for_backup(&home, "delete", &name)
                .with_context(|| format!("failed to delete {name}"))?;
            println!("✓ Deleted {name}");
        }
        BackupCommand::Restore { name } => {
            let data = request_for_backup(&home, "restore", &name)
                .with_context(|| format!("failed to restore {name}"))?;
            let report = &data["report"];
            println!(
                "✓ Restored {name} into {} ({} files)",
                report["world"].as_str().unwrap_or("-"),
                report["files_restored"].as_u64().unwrap_or_default()
            );
            if let Some(previous) = report["previous_world"].as_str() {
                println!("  previous world kept at {previous}");
            }
        }
        BackupCommand::Config(args) => {
            let mut config = load_config_at(&home)
                .context("failed to load config — run `hearth init` first")?;
            if args.is_update() {
                let mut backup = config.backup;
                if let Some(frequency) = args.frequency {
                    backup.frequency_minutes = frequency;
                }
                if let Some(dir) = args.dir {
                    backup.backup_directory = dir;
                }
                if let Some(keep) = args.keep {
                    backup.max_backups_to_keep = keep;
                }
                if let Some(world) = args.world {
                    backup.world_path = Some(world);
                }
                config = update_backup_config_at(&home, backup)
                    .context("backup configuration rejected")?;
                println!("✓ Backup configuration updated");
            }
            print_json(
                &serde_json::to_value(&config.backup).context("failed to encode config")?,
            )?;
        }
    }

    Ok(())
}

fn report_run(data: &Value) -> Result<()> {
    let status = data["status"].as_str().unwrap_or("unknown");
    match status {
        "succeeded" => {
            println!(
                "{} {} ({} files)",
                "✓ Backup succeeded:".green().bold(),
                data["directory"].as_str().unwrap_or("-"),
                data["copied"].as_u64().unwrap_or_default(),
            );
        }
        "partial" => {
            println!(
                "{} {} ({} copied, {} failed)",
                "! Backup incomplete:".yellow().bold(),
                data["directory"].as_str().unwrap_or("-"),
                data["copied"].as_u64().unwrap_or_default(),
                data["failed"].as_u64().unwrap_or_default(),
            );
        }
        "already_running" => bail!("a backup is already in progress"),
        _ => bail!(
            "backup failed: {}",
            data["error"].as_str().unwrap_or("unknown error")
        ),
    }
    if let Some(pruned) = data["pruned"]["deleted"].as_u64().filter(|n| *n > 0) {
        println!("  removed {pruned} old backup(s)");
    }
    Ok(())
}

fn print_backups(root: &std::path::Path, backups: Vec<BackupEntry>) {
    if backups.is_empty() {
        println!("No backups in {}", root.display());
        return;
    }

    let rows: Vec<BackupRow> = backups
        .into_iter()
        .map(|entry| BackupRow {
            name: entry.name,
            created: entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            size: format_size(entry.size_bytes),
        })
        .collect();
    let count = rows.len();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    println!("{count} backup(s) in {}", root.display());
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(5 * 1024 * 1024 + 512 * 1024), "5.5 MiB");
    }

    #[test]
    fn failed_and_busy_runs_are_errors() {
        assert!(report_run(&json!({ "status": "succeeded", "copied": 3 })).is_ok());
        assert!(report_run(&json!({ "status": "partial", "copied": 3, "failed": 2 })).is_ok());
        assert!(report_run(&json!({ "status": "already_running" })).is_err());

        let err = report_run(&json!({ "status": "failed", "error": "manifest empty" })).unwrap_err();
        assert!(err.to_string().contains("manifest empty"));
    }
}
