use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;

use hearth_core::config::{load_config_at, save_config_at};
use hearth_core::{BackupConfiguration, HostConfig, RunnerConfig};
use tempfile::TempDir;

fn hearth_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("hearth"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1");
    cmd
}

fn write_config(home: &Path, exe: &Path, backups: &Path) {
    let config = HostConfig {
        runner: RunnerConfig {
            exe_path: exe.to_path_buf(),
            ..RunnerConfig::default()
        },
        backup: BackupConfiguration {
            backup_directory: backups.to_path_buf(),
            ..BackupConfiguration::default()
        },
    };
    save_config_at(home, &config).expect("save config");
}

#[test]
fn init_writes_config_once() {
    let home = TempDir::new().expect("home");
    let backups = home.path().join("backups");

    hearth_cmd(home.path())
        .args(["init", "--exe", "/srv/bedrock/bedrock_server", "--frequency", "15"])
        .arg("--backup-dir")
        .arg(&backups)
        .assert()
        .success()
        .stdout(contains("Wrote"));

    let config = load_config_at(home.path()).expect("config written");
    assert_eq!(config.runner.exe_path, Path::new("/srv/bedrock/bedrock_server"));
    assert_eq!(config.backup.frequency_minutes, 15);
    assert_eq!(config.backup.backup_directory, backups);
    assert_eq!(config.backup.max_backups_to_keep, 10);

    hearth_cmd(home.path())
        .args(["init", "--exe", "/elsewhere/bedrock_server"])
        .assert()
        .success()
        .stdout(contains("already exists"));
    let config = load_config_at(home.path()).expect("config kept");
    assert_eq!(config.runner.exe_path, Path::new("/srv/bedrock/bedrock_server"));
}

#[test]
fn init_rejects_out_of_range_frequency() {
    let home = TempDir::new().expect("home");
    hearth_cmd(home.path())
        .args(["init", "--backup-dir", "/tmp/hearth-backups", "--frequency", "0"])
        .assert()
        .failure()
        .stderr(contains("invalid backup settings"));
    assert!(load_config_at(home.path()).is_err());
}

#[test]
fn daemon_start_fails_without_config() {
    let home = TempDir::new().expect("home");
    hearth_cmd(home.path())
        .args(["daemon", "start"])
        .assert()
        .failure()
        .stderr(contains("daemon exited with error"));
}

#[test]
fn daemon_start_fails_fast_for_missing_executable() {
    let home = TempDir::new().expect("home");
    write_config(
        home.path(),
        &home.path().join("no-such-server"),
        &home.path().join("backups"),
    );

    hearth_cmd(home.path())
        .args(["daemon", "start"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn daemon_start_requires_exe_path() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), Path::new(""), &home.path().join("backups"));

    hearth_cmd(home.path())
        .args(["daemon", "start"])
        .assert()
        .failure()
        .stderr(contains("exe_path"));
}

#[test]
fn status_reports_daemon_not_running() {
    let home = TempDir::new().expect("home");
    let output = hearth_cmd(home.path())
        .args(["daemon", "status"])
        .output()
        .expect("run status");
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["running"], serde_json::json!(false));
    assert!(value["socket"].as_str().unwrap().ends_with("hearth.sock"));

    hearth_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("not running"));
}

#[test]
fn server_commands_need_the_daemon() {
    let home = TempDir::new().expect("home");
    hearth_cmd(home.path())
        .args(["server", "send", "say", "hello"])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));

    hearth_cmd(home.path())
        .args(["backup", "now"])
        .assert()
        .failure()
        .stderr(contains("daemon is not running"));
}

#[test]
fn backup_list_reads_the_directory() {
    let home = TempDir::new().expect("home");
    let backups = home.path().join("backups");
    write_config(home.path(), Path::new("/srv/bedrock/bedrock_server"), &backups);

    hearth_cmd(home.path())
        .args(["backup", "list"])
        .assert()
        .success()
        .stdout(contains("No backups"));

    for name in ["backup_2024-05-01_12-00-00", "backup_2024-05-02_12-00-00"] {
        let dir = backups.join(name);
        fs::create_dir_all(dir.join("db")).expect("mkdir");
        fs::write(dir.join("level.dat"), vec![0u8; 2048]).expect("write");
    }
    fs::create_dir_all(backups.join("notes")).expect("mkdir other");

    hearth_cmd(home.path())
        .args(["backup", "list"])
        .assert()
        .success()
        .stdout(
            contains("backup_2024-05-01_12-00-00")
                .and(contains("backup_2024-05-02_12-00-00"))
                .and(contains("2.0 KiB"))
                .and(contains("notes").not()),
        );

    let output = hearth_cmd(home.path())
        .args(["backup", "list", "--json"])
        .output()
        .expect("run list");
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value.as_array().map(Vec::len), Some(2));
}

#[test]
fn backup_config_shows_and_updates() {
    let home = TempDir::new().expect("home");
    let backups = home.path().join("backups");
    write_config(home.path(), Path::new("/srv/bedrock/bedrock_server"), &backups);

    hearth_cmd(home.path())
        .args(["backup", "config"])
        .assert()
        .success()
        .stdout(contains("\"frequency_minutes\": 30"));

    hearth_cmd(home.path())
        .args(["backup", "config", "--frequency", "5", "--keep", "3"])
        .assert()
        .success()
        .stdout(contains("updated"));
    let config = load_config_at(home.path()).expect("config");
    assert_eq!(config.backup.frequency_minutes, 5);
    assert_eq!(config.backup.max_backups_to_keep, 3);
    assert_eq!(config.runner.exe_path, Path::new("/srv/bedrock/bedrock_server"));

    hearth_cmd(home.path())
        .args(["backup", "config", "--frequency", "2000"])
        .assert()
        .failure()
        .stderr(contains("rejected"));
    assert_eq!(
        load_config_at(home.path()).expect("config").backup.frequency_minutes,
        5
    );
}
