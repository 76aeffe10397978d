use std::path::{Path, PathBuf};
use std::time::Duration;

use hearth_core::RunnerConfig;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const CONFIG_FILE: &str = "config.yaml";
pub const SERVER_PROPERTIES: &str = "server.properties";

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const CONSOLE_LOG: &str = "console.log";
pub const DAEMON_SOCKET: &str = "hearth.sock";

pub fn hearth_root(home: &Path) -> PathBuf {
    hearth_core::config::hearth_root(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    hearth_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    hearth_root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}

/// Console mirror: `runner.console_log` if set, else `logs/console.log`.
pub fn console_log_path(home: &Path, runner: &RunnerConfig) -> PathBuf {
    runner
        .console_log
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| logs_dir(home).join(CONSOLE_LOG))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_log_defaults_under_logs_dir() {
        let home = Path::new("/home/steve");
        let runner = RunnerConfig::default();
        assert_eq!(
            console_log_path(home, &runner),
            PathBuf::from("/home/steve/.hearth/logs/console.log")
        );

        let custom = RunnerConfig {
            console_log: Some(PathBuf::from("/var/log/bedrock.log")),
            ..Default::default()
        };
        assert_eq!(
            console_log_path(home, &custom),
            PathBuf::from("/var/log/bedrock.log")
        );
    }

    #[test]
    fn socket_lives_in_hearth_root() {
        assert_eq!(
            socket_path(Path::new("/home/steve")),
            PathBuf::from("/home/steve/.hearth/hearth.sock")
        );
    }
}
