use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use hearth_backup::{BackupCoordinator, BackupOutcome, BackupRun, TriggerOutcome};
use hearth_core::config::{load_config_at, validate_backup, validate_runner};
use hearth_core::{server_dir, BackupConfiguration, LevelNameResolver};
use hearth_process::{default_containment, CommandResponse, LogStore, ProcessSupervisor};

use crate::error::{io_err, DaemonError};
use crate::log_rotation::rotated_files;
use crate::paths::{
    console_log_path, hearth_root, logs_dir, socket_path, CONFIG_FILE, DEBOUNCE_WINDOW,
    SERVER_PROPERTIES,
};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Everything a socket client can reach.
struct DaemonState {
    home: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
    coordinator: Arc<BackupCoordinator>,
    levels: Arc<LevelNameResolver>,
    stop_grace: Duration,
    started_at_unix: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchedFile {
    Config,
    ServerProperties,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon: launch the server, then serve the scheduler, config
/// watcher, control socket and log rotation until shutdown.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = load_config_at(&home)?;
    validate_runner(&config)?;
    if let Err(err) = validate_backup(&config.backup) {
        tracing::warn!(error = %err, "backup configuration incomplete, scheduled backups paused");
    }

    let runner = config.runner.clone();
    let console_log = console_log_path(&home, &runner);
    let stop_grace = Duration::from_secs(runner.stop_grace_secs);
    let supervisor = Arc::new(
        ProcessSupervisor::new(
            Arc::new(LogStore::with_mirror(&console_log)),
            default_containment(),
        )
        .with_stop_grace(stop_grace),
    );
    supervisor
        .start_with_args(
            &runner.exe_path,
            &runner.args,
            runner.effective_working_dir().as_deref(),
        )
        .await?;

    let levels = Arc::new(LevelNameResolver::for_executable(&runner.exe_path));
    let (config_tx, config_rx) = watch::channel(config.backup.clone());
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let coordinator = Arc::new(
        BackupCoordinator::new(
            supervisor.clone(),
            levels.clone(),
            config_rx,
            shutdown_tx.clone(),
        )
        .with_server_dir(server_dir(&runner.exe_path)),
    );

    let state = Arc::new(DaemonState {
        home: home.clone(),
        supervisor: supervisor.clone(),
        coordinator: coordinator.clone(),
        levels,
        stop_grace,
        started_at_unix: unix_seconds_now(),
    });

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = watcher_task(state, config_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator.run_schedule().await;
            let _ = shutdown.send(());
            Ok(())
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let result = socket_server_task(state, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let files = rotated_files(&home, &console_log);
        tokio::spawn(async move {
            let result = log_rotation_task(files, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, scheduler_result, socket_result, rotation_result, signal_result) = tokio::join!(
        watcher_handle,
        scheduler_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    supervisor.stop(stop_grace).await;
    tracing::info!("daemon stopped");

    handle_join("watcher", watcher_result)?;
    handle_join("backup_scheduler", scheduler_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Config watcher
// ---------------------------------------------------------------------------

async fn watcher_task(
    state: Arc<DaemonState>,
    config_tx: watch::Sender<BackupConfiguration>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = hearth_root(&state.home);
    // Event paths arrive canonicalized on some platforms.
    let root = fs::canonicalize(&root).unwrap_or(root);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&root, RecursiveMode::NonRecursive)?;
    tracing::debug!(path = %root.display(), "watching config directory");

    let server_home = state
        .levels
        .properties_path()
        .and_then(Path::parent)
        .and_then(|dir| fs::canonicalize(dir).ok());
    if let Some(dir) = server_home.as_deref() {
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => tracing::debug!(path = %dir.display(), "watching server directory"),
            Err(err) => tracing::warn!(
                path = %dir.display(),
                error = %err,
                "server.properties changes will not be noticed",
            ),
        }
    }

    let mut pending = PendingReloads::new(DEBOUNCE_WINDOW);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = sleep_until_deadline(pending.next_deadline()) => {
                for file in pending.take_due(Instant::now()) {
                    match file {
                        WatchedFile::Config => reload_backup_config(&state.home, &config_tx).await,
                        WatchedFile::ServerProperties => {
                            state.levels.invalidate();
                            tracing::info!("server.properties changed, level name will be re-read");
                        }
                    }
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                for path in event.paths {
                    if let Some(file) = classify_path(&path, &root, server_home.as_deref()) {
                        pending.note(&path, file, Instant::now());
                    }
                }
            }
        }
    }

    Ok(())
}

async fn reload_backup_config(home: &Path, config_tx: &watch::Sender<BackupConfiguration>) {
    let home = home.to_path_buf();
    let loaded = tokio::task::spawn_blocking(move || load_config_at(&home)).await;
    match loaded {
        Ok(Ok(config)) => {
            apply_backup_config(config_tx, config.backup);
        }
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "config reload failed, keeping current settings")
        }
        Err(err) => tracing::warn!(error = %err, "config reload task failed"),
    }
}

/// Publish `backup` if it is valid and differs from the current value.
fn apply_backup_config(
    config_tx: &watch::Sender<BackupConfiguration>,
    backup: BackupConfiguration,
) -> bool {
    if let Err(err) = validate_backup(&backup) {
        tracing::warn!(error = %err, "ignoring invalid backup configuration");
        return false;
    }
    let changed = config_tx.send_if_modified(|current| {
        if *current == backup {
            return false;
        }
        *current = backup;
        true
    });
    if changed {
        let current = config_tx.borrow();
        tracing::info!(
            frequency_minutes = current.frequency_minutes,
            directory = %current.backup_directory.display(),
            max_backups_to_keep = current.max_backups_to_keep,
            "backup configuration updated",
        );
    }
    changed
}

fn classify_path(path: &Path, root: &Path, server_home: Option<&Path>) -> Option<WatchedFile> {
    let name = path.file_name()?.to_str()?;
    let parent = path.parent()?;
    if name == CONFIG_FILE && parent == root {
        return Some(WatchedFile::Config);
    }
    if name == SERVER_PROPERTIES && Some(parent) == server_home {
        return Some(WatchedFile::ServerProperties);
    }
    None
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

/// Trailing-edge debounce: a watched path fires once it has been quiet for
/// `window`.
struct PendingReloads {
    window: Duration,
    due: HashMap<PathBuf, (WatchedFile, Instant)>,
}

impl PendingReloads {
    fn new(window: Duration) -> Self {
        Self {
            window,
            due: HashMap::new(),
        }
    }

    fn note(&mut self, path: &Path, file: WatchedFile, now: Instant) {
        self.due.insert(path.to_path_buf(), (file, now + self.window));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.due.values().map(|(_, at)| *at).min()
    }

    fn take_due(&mut self, now: Instant) -> Vec<WatchedFile> {
        let mut fired = Vec::new();
        self.due.retain(|_, (file, at)| {
            if *at <= now {
                fired.push(*file);
                false
            } else {
                true
            }
        });
        fired
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn socket_server_task(
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&state.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = handle_request(&state, &shutdown_tx, &request).await;
        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn handle_request(
    state: &DaemonState,
    shutdown_tx: &broadcast::Sender<()>,
    request: &DaemonRequest,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(state).await),
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        "log" => {
            let log = state.supervisor.log_store();
            let text = match request.lines {
                Some(n) => log.tail(n).join("\n"),
                None => log.snapshot(),
            };
            DaemonResponse::ok(json!({ "lines": log.line_count(), "log": text }))
        }
        "send" => match request.line.as_deref() {
            Some(line) if !line.trim().is_empty() => send_console_line(state, line, request.timeout_ms).await,
            _ => DaemonResponse::error("send requires a non-empty line"),
        },
        "restart" => {
            if state.supervisor.restart().await {
                DaemonResponse::ok(json!({ "restarted": true, "pid": state.supervisor.pid().await }))
            } else {
                DaemonResponse::error("server restart failed; see daemon log")
            }
        }
        "backup" => match state.coordinator.trigger_manual().await {
            TriggerOutcome::Completed(run) => DaemonResponse::ok(backup_run_payload(&run)),
            TriggerOutcome::AlreadyRunning => {
                DaemonResponse::ok(json!({ "status": "already_running" }))
            }
        },
        "backups" => match state.coordinator.list_backups().await {
            Ok(backups) => DaemonResponse::ok(json!(backups)),
            Err(err) => DaemonResponse::error(err.to_string()),
        },
        "delete" => match request.backup.as_deref() {
            Some(name) => match state.coordinator.delete_backup(name).await {
                Ok(()) => DaemonResponse::ok(json!({ "deleted": name })),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            None => DaemonResponse::error("delete requires a backup name"),
        },
        "restore" => match request.backup.as_deref() {
            Some(name) => match restore_and_relaunch(state, name).await {
                Ok(data) => DaemonResponse::ok(data),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            None => DaemonResponse::error("restore requires a backup name"),
        },
        "config" => DaemonResponse::ok(json!(state.coordinator.configuration())),
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

async fn send_console_line(
    state: &DaemonState,
    line: &str,
    timeout_ms: Option<u64>,
) -> DaemonResponse {
    let Some(timeout_ms) = timeout_ms else {
        return match state.supervisor.try_send_line(line).await {
            Ok(()) => DaemonResponse::ok(json!({ "sent": true })),
            Err(err) => DaemonResponse::error(err.to_string()),
        };
    };

    let timeout = Duration::from_millis(timeout_ms);
    match state
        .supervisor
        .send_line_and_await_response(line, timeout)
        .await
    {
        Some(CommandResponse::Output(output)) => {
            DaemonResponse::ok(json!({ "sent": true, "output": output }))
        }
        Some(CommandResponse::NoOutput) => {
            DaemonResponse::ok(json!({ "sent": true, "output": Value::Null }))
        }
        None => DaemonResponse::error("command not delivered; is the server running?"),
    }
}

async fn restore_and_relaunch(state: &DaemonState, name: &str) -> Result<Value, DaemonError> {
    let ticket = state.coordinator.begin_restore(name)?;
    tracing::info!(backup = %ticket.name(), "stopping server for restore");
    state.supervisor.stop(state.stop_grace).await;
    let restored = state.coordinator.finish_restore(&ticket).await;
    let relaunched = state.supervisor.relaunch().await;
    drop(ticket);

    let report = restored?;
    match relaunched {
        Ok(pid) => Ok(json!({ "report": report, "pid": pid })),
        Err(err) => Err(DaemonError::Protocol(format!(
            "backup {} restored but the server did not start: {err}",
            report.backup
        ))),
    }
}

async fn build_status_payload(state: &DaemonState) -> Value {
    let server = state.supervisor.status().await;
    json!({
        "running": true,
        "daemon_pid": std::process::id(),
        "started_at_unix": state.started_at_unix,
        "socket": socket_path(&state.home).display().to_string(),
        "server": server,
        "level_name": state.levels.current(),
        "world_path": state.coordinator.world_path().display().to_string(),
        "backup": state.coordinator.configuration(),
    })
}

fn backup_run_payload(run: &BackupRun) -> Value {
    let (status, error) = match &run.outcome {
        BackupOutcome::Succeeded => ("succeeded", None),
        BackupOutcome::PartialSuccess => ("partial", None),
        BackupOutcome::Failed(err) => ("failed", Some(err.to_string())),
    };
    json!({
        "status": status,
        "error": error,
        "started_at": run.started_at.to_rfc3339(),
        "directory": run.directory.as_ref().map(|d| d.display().to_string()),
        "files": run.files,
        "copied": run.copied,
        "failed": run.failed,
        "pruned": run.pruned,
        "resumed": run.resumed,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

async fn log_rotation_task(
    files: Vec<PathBuf>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let files = files.clone();
                tokio::task::spawn_blocking(move || crate::log_rotation::rotate_logs(&files))
                    .await
                    .ok();
            }
        }
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [hearth_root(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
