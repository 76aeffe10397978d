//! The save hold / query / resume protocol and its scheduler.
//!
//! ## One run
//!
//! 1. `save hold`. A failed send ends the run; nothing needs resuming.
//! 2. Settle while the server flushes.
//! 3. Note the log offset, send `save query`.
//! 4. Poll the text written since that offset for a save-ready marker.
//! 5. Parse the newest manifest line in the full log.
//! 6. Create `backup_<timestamp>` and copy the listed files.
//! 7. `save resume`, whatever happened in steps 2-6.
//! 8. Retention sweep, only if something was copied.
//!
//! Shutdown cuts every wait in steps 2-5 short and jumps to step 7.
//! Configuration changes never touch a run in progress.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tokio::time::Instant;

use hearth_core::{resolve_world_path, BackupConfiguration, BackupEntry, LevelNameResolver};
use hearth_process::ServerConsole;

use crate::copy::{copy_world_files, create_backup_dir, CopyReport};
use crate::error::{io_err, BackupError};
use crate::manifest::{contains_ready_marker, parse_manifest};
use crate::restore::{restore_backup, RestoreReport};
use crate::retention::{self, PruneReport};

pub const SAVE_HOLD: &str = "save hold";
pub const SAVE_QUERY: &str = "save query";
pub const SAVE_RESUME: &str = "save resume";

/// Fixed delays of the protocol and scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimings {
    pub hold_settle: Duration,
    pub signal_poll: Duration,
    pub signal_timeout: Duration,
    pub manifest_settle: Duration,
    pub resume_settle: Duration,
    pub startup_delay: Duration,
    pub restart_backoff: Duration,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            hold_settle: Duration::from_secs(3),
            signal_poll: Duration::from_millis(500),
            signal_timeout: Duration::from_secs(10),
            manifest_settle: Duration::from_millis(500),
            resume_settle: Duration::from_secs(1),
            startup_delay: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

impl ProtocolTimings {
    /// Millisecond-scale timings for tests and local experiments.
    pub fn fast() -> Self {
        Self {
            hold_settle: Duration::from_millis(10),
            signal_poll: Duration::from_millis(10),
            signal_timeout: Duration::from_millis(500),
            manifest_settle: Duration::from_millis(5),
            resume_settle: Duration::from_millis(5),
            startup_delay: Duration::ZERO,
            restart_backoff: Duration::from_millis(10),
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum BackupOutcome {
    Succeeded,
    /// Some files copied, some not.
    PartialSuccess,
    Failed(BackupError),
}

/// Record of one protocol run.
#[derive(Debug)]
pub struct BackupRun {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub directory: Option<PathBuf>,
    pub files: usize,
    pub copied: usize,
    pub failed: usize,
    pub pruned: Option<PruneReport>,
    pub resumed: bool,
    pub outcome: BackupOutcome,
}

impl BackupRun {
    fn begin() -> Self {
        let now = Local::now();
        Self {
            started_at: now,
            finished_at: now,
            directory: None,
            files: 0,
            copied: 0,
            failed: 0,
            pruned: None,
            resumed: false,
            outcome: BackupOutcome::Succeeded,
        }
    }

    fn fail(mut self, err: BackupError) -> Self {
        self.outcome = BackupOutcome::Failed(err);
        self.finished_at = Local::now();
        self
    }

    /// Succeeded or partially succeeded.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, BackupOutcome::Failed(_))
    }

    pub fn error(&self) -> Option<&BackupError> {
        match &self.outcome {
            BackupOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Result of [`BackupCoordinator::trigger_manual`].
#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(BackupRun),
    AlreadyRunning,
}

enum LoopExit {
    Shutdown,
    ConfigChanged,
}

/// A validated restore target with the backup guard held.
pub struct RestoreTicket<'a> {
    _guard: MutexGuard<'a, ()>,
    name: String,
    root: PathBuf,
}

impl RestoreTicket<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Runs backups against a [`ServerConsole`], one at a time.
pub struct BackupCoordinator {
    console: Arc<dyn ServerConsole>,
    levels: Arc<LevelNameResolver>,
    server_dir: Option<PathBuf>,
    config: watch::Receiver<BackupConfiguration>,
    shutdown: broadcast::Sender<()>,
    guard: Mutex<()>,
    timings: ProtocolTimings,
}

impl BackupCoordinator {
    pub fn new(
        console: Arc<dyn ServerConsole>,
        levels: Arc<LevelNameResolver>,
        config: watch::Receiver<BackupConfiguration>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            console,
            levels,
            server_dir: None,
            config,
            shutdown,
            guard: Mutex::new(()),
            timings: ProtocolTimings::default(),
        }
    }

    /// Directory of the server executable; worlds live under `<dir>/worlds`.
    pub fn with_server_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.server_dir = dir;
        self
    }

    pub fn with_timings(mut self, timings: ProtocolTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn configuration(&self) -> BackupConfiguration {
        self.config.borrow().clone()
    }

    /// Live world directory for the current configuration and level name.
    pub fn world_path(&self) -> PathBuf {
        let config = self.configuration();
        resolve_world_path(&config, self.server_dir.as_deref(), &self.levels.current())
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Run a backup now, unless one is already in progress.
    pub async fn trigger_manual(&self) -> TriggerOutcome {
        let Ok(_guard) = self.guard.try_lock() else {
            tracing::info!("manual backup rejected, another backup is in progress");
            return TriggerOutcome::AlreadyRunning;
        };
        let config = self.configuration();
        tracing::info!("manual backup requested");
        let run = self.run_protocol(&config).await;
        log_run(&run, "manual");
        TriggerOutcome::Completed(run)
    }

    /// Scheduled backups until shutdown.
    ///
    /// A configuration change interrupts the wait for the next run and
    /// restarts the loop with the new settings after a short backoff.
    pub async fn run_schedule(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut config_rx = self.config.clone();
        let mut startup_pending = true;

        loop {
            let exit = self
                .schedule_pass(&mut config_rx, &mut shutdown, &mut startup_pending)
                .await;
            match exit {
                LoopExit::Shutdown => break,
                LoopExit::ConfigChanged => {
                    tracing::info!("backup configuration changed, restarting schedule");
                    tokio::select! {
                        _ = tokio::time::sleep(self.timings.restart_backoff) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
        tracing::info!("backup scheduler stopped");
    }

    async fn schedule_pass(
        &self,
        config_rx: &mut watch::Receiver<BackupConfiguration>,
        shutdown: &mut broadcast::Receiver<()>,
        startup_pending: &mut bool,
    ) -> LoopExit {
        let config = config_rx.borrow_and_update().clone();

        if !config.is_schedulable() {
            tracing::warn!(
                frequency_minutes = config.frequency_minutes,
                directory = %config.backup_directory.display(),
                "scheduled backups paused until configuration changes",
            );
            return tokio::select! {
                _ = config_changed(config_rx) => LoopExit::ConfigChanged,
                _ = shutdown.recv() => LoopExit::Shutdown,
            };
        }

        if let Err(e) = std::fs::create_dir_all(&config.backup_directory) {
            tracing::warn!(
                path = %config.backup_directory.display(),
                error = %e,
                "backup directory could not be created",
            );
        }

        if *startup_pending {
            tracing::info!(
                delay_secs = self.timings.startup_delay.as_secs(),
                "waiting for server startup before scheduling backups",
            );
            tokio::select! {
                _ = tokio::time::sleep(self.timings.startup_delay) => *startup_pending = false,
                _ = config_changed(config_rx) => return LoopExit::ConfigChanged,
                _ = shutdown.recv() => return LoopExit::Shutdown,
            }
        }

        loop {
            let config = config_rx.borrow().clone();
            let interval = Duration::from_secs(u64::from(config.frequency_minutes) * 60);
            tracing::info!(
                frequency_minutes = config.frequency_minutes,
                directory = %config.backup_directory.display(),
                "next scheduled backup armed",
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = config_changed(config_rx) => return LoopExit::ConfigChanged,
                _ = shutdown.recv() => return LoopExit::Shutdown,
            }

            let _guard = tokio::select! {
                guard = self.guard.lock() => guard,
                _ = config_changed(config_rx) => return LoopExit::ConfigChanged,
                _ = shutdown.recv() => return LoopExit::Shutdown,
            };
            let run = self.run_protocol(&config).await;
            log_run(&run, "scheduled");
        }
    }

    // -----------------------------------------------------------------------
    // Protocol
    // -----------------------------------------------------------------------

    /// One full run. The caller holds the guard.
    async fn run_protocol(&self, config: &BackupConfiguration) -> BackupRun {
        let run = BackupRun::begin();
        if config.backup_directory.as_os_str().is_empty() {
            return run.fail(BackupError::NotConfigured(
                "backup_directory is empty".to_string(),
            ));
        }

        let mut shutdown = self.shutdown.subscribe();

        if !self.console.send_line(SAVE_HOLD).await {
            return run.fail(self.send_failure(SAVE_HOLD).await);
        }
        tracing::debug!("save hold sent");

        let mut run = run;
        let result = self.hold_and_copy(config, &mut run, &mut shutdown).await;

        run.resumed = self.resume().await;

        run.outcome = match result {
            Err(err) => BackupOutcome::Failed(err),
            Ok(CopyReport { copied: 0, failed }) => {
                BackupOutcome::Failed(BackupError::NoFilesCopied { failed })
            }
            Ok(CopyReport { copied, failed }) if failed > 0 => {
                let warning = BackupError::PartialCopyFailure { copied, failed };
                tracing::warn!(error = %warning, "backup incomplete");
                BackupOutcome::PartialSuccess
            }
            Ok(_) => BackupOutcome::Succeeded,
        };

        if run.copied > 0 {
            run.pruned = self.sweep(config).await;
        }

        run.finished_at = Local::now();
        run
    }

    /// Steps 2 through 6. Any error still leads to resume.
    async fn hold_and_copy(
        &self,
        config: &BackupConfiguration,
        run: &mut BackupRun,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<CopyReport, BackupError> {
        pause(self.timings.hold_settle, shutdown).await?;

        let log = self.console.log();
        let query_offset = log.len();
        if !self.console.send_line(SAVE_QUERY).await {
            return Err(self.send_failure(SAVE_QUERY).await);
        }

        self.await_ready_marker(query_offset, shutdown).await?;
        pause(self.timings.manifest_settle, shutdown).await?;

        let level = self.levels.current();
        let files = parse_manifest(&log.snapshot(), &level);
        if files.is_empty() {
            return Err(BackupError::ManifestEmpty { level });
        }
        run.files = files.len();
        tracing::info!(files = files.len(), level = %level, "manifest parsed");

        let world = resolve_world_path(config, self.server_dir.as_deref(), &level);
        let root = config.backup_directory.clone();
        let started_at = run.started_at;
        let (directory, report) = tokio::task::spawn_blocking(move || {
            let directory = create_backup_dir(&root, started_at)?;
            let report = copy_world_files(&world, &directory, &files);
            Ok::<_, BackupError>((directory, report))
        })
        .await
        .map_err(|e| io_err(&config.backup_directory, std::io::Error::other(e)))??;

        run.directory = Some(directory);
        run.copied = report.copied;
        run.failed = report.failed;
        Ok(report)
    }

    async fn await_ready_marker(
        &self,
        offset: usize,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), BackupError> {
        let deadline = Instant::now() + self.timings.signal_timeout;
        loop {
            if contains_ready_marker(&self.console.log().since(offset)) {
                tracing::debug!("save-ready marker seen");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BackupError::SaveQuerySignalTimeout {
                    waited: self.timings.signal_timeout,
                });
            }
            pause(self.timings.signal_poll, shutdown).await?;
        }
    }

    async fn resume(&self) -> bool {
        if !self.console.send_line(SAVE_RESUME).await {
            tracing::error!("save resume not delivered, world may still be on hold");
            return false;
        }
        tracing::debug!("save resume sent");
        tokio::time::sleep(self.timings.resume_settle).await;
        true
    }

    async fn send_failure(&self, command: &str) -> BackupError {
        if self.console.is_running().await {
            BackupError::CommandSendFailed {
                command: command.to_string(),
            }
        } else {
            BackupError::ProcessNotRunning
        }
    }

    async fn sweep(&self, config: &BackupConfiguration) -> Option<PruneReport> {
        let root = config.backup_directory.clone();
        let keep = config.max_backups_to_keep;
        let result = tokio::task::spawn_blocking(move || retention::prune(&root, keep)).await;
        match result {
            Ok(Ok(report)) => {
                if report.failed > 0 {
                    let warning = BackupError::RetentionSweepPartialFailure {
                        failed: report.failed,
                    };
                    tracing::warn!(error = %warning, "retention sweep incomplete");
                }
                Some(report)
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "retention sweep failed");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "retention task failed");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Catalogue
    // -----------------------------------------------------------------------

    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>, BackupError> {
        let root = self.configuration().backup_directory;
        tokio::task::spawn_blocking(move || retention::list_backups(&root))
            .await
            .map_err(|e| io_err("backup list", std::io::Error::other(e)))?
    }

    /// Delete one backup. Waits for any run in progress.
    pub async fn delete_backup(&self, name: &str) -> Result<(), BackupError> {
        let _guard = self.guard.lock().await;
        let root = self.configuration().backup_directory;
        let name = name.to_string();
        tokio::task::spawn_blocking(move || retention::delete_backup(&root, &name))
            .await
            .map_err(|e| io_err("backup delete", std::io::Error::other(e)))?
    }

    /// Replace the live world with backup `name`. The server must be stopped.
    pub async fn restore(&self, name: &str) -> Result<RestoreReport, BackupError> {
        let ticket = self.begin_restore(name)?;
        self.finish_restore(&ticket).await
    }

    /// Check that `name` exists and claim the guard, before anything touches
    /// the server. Holding the ticket keeps scheduled and manual runs out.
    pub fn begin_restore(&self, name: &str) -> Result<RestoreTicket<'_>, BackupError> {
        retention::validate_backup_name(name)?;
        let root = self.configuration().backup_directory;
        if !root.join(name).is_dir() {
            return Err(BackupError::BackupNotFound {
                name: name.to_string(),
            });
        }
        let Ok(guard) = self.guard.try_lock() else {
            return Err(BackupError::AlreadyRunning);
        };
        Ok(RestoreTicket {
            _guard: guard,
            name: name.to_string(),
            root,
        })
    }

    /// Copy the ticket's backup over the live world.
    pub async fn finish_restore(
        &self,
        ticket: &RestoreTicket<'_>,
    ) -> Result<RestoreReport, BackupError> {
        if self.console.is_running().await {
            return Err(BackupError::ServerRunning);
        }

        let root = ticket.root.clone();
        let name = ticket.name.clone();
        let world = self.world_path();
        tracing::info!(backup = %name, world = %world.display(), "restoring backup");
        tokio::task::spawn_blocking(move || restore_backup(&root, &name, &world, Local::now()))
            .await
            .map_err(|e| io_err("backup restore", std::io::Error::other(e)))?
    }
}

/// Sleep for `d` unless shutdown arrives first.
async fn pause(d: Duration, shutdown: &mut broadcast::Receiver<()>) -> Result<(), BackupError> {
    tokio::select! {
        _ = tokio::time::sleep(d) => Ok(()),
        _ = shutdown.recv() => Err(BackupError::Cancelled),
    }
}

/// Resolves on the next configuration change. Never resolves once the
/// sender is gone.
async fn config_changed(rx: &mut watch::Receiver<BackupConfiguration>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn log_run(run: &BackupRun, trigger: &str) {
    let directory = run
        .directory
        .as_deref()
        .map(|d| d.display().to_string())
        .unwrap_or_default();
    match &run.outcome {
        BackupOutcome::Succeeded => tracing::info!(
            trigger,
            copied = run.copied,
            directory = %directory,
            "backup completed",
        ),
        BackupOutcome::PartialSuccess => tracing::warn!(
            trigger,
            copied = run.copied,
            failed = run.failed,
            directory = %directory,
            "backup completed with missing files",
        ),
        BackupOutcome::Failed(err) => tracing::error!(trigger, error = %err, "backup failed"),
    }
}
