use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use hearth_core::{ProcessState, ProcessStatus};

use crate::containment::Containment;
use crate::error::ProcessError;
use crate::log_store::LogStore;

/// Time the child gets to honour `stop` before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How often [`ProcessSupervisor::send_line_and_await_response`] re-checks the log.
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const RESTART_SETTLE: Duration = Duration::from_secs(2);

/// Result of a command that expects console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    /// Text the child printed after the command, trimmed.
    Output(String),
    /// The command was delivered but nothing appeared before the timeout.
    NoOutput,
}

/// The console surface the backup protocol needs: write a line, read the log,
/// ask whether the child is alive.
#[async_trait]
pub trait ServerConsole: Send + Sync {
    /// Write `line` plus a newline to the child's stdin. `false` when the
    /// child is not running or the write failed.
    async fn send_line(&self, line: &str) -> bool;

    async fn is_running(&self) -> bool;

    fn log(&self) -> &LogStore;
}

#[derive(Debug, Clone)]
struct LaunchSpec {
    exe: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    pid: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    // Readers finish on their own at EOF; dropping the handles detaches them.
    _readers: [JoinHandle<()>; 2],
}

impl Session {
    fn into_exited(self, exit_code: Option<i32>) -> SessionState {
        SessionState::Exited {
            pid: self.pid,
            started_at: self.started_at,
            exit_code,
        }
    }
}

enum SessionState {
    NotStarted,
    Running(Session),
    Exited {
        pid: u32,
        started_at: DateTime<Utc>,
        exit_code: Option<i32>,
    },
}

/// Owns one child process at a time.
///
/// All state sits behind a single async mutex. Exits are noticed lazily:
/// every operation polls the child first, so a crash shows up as
/// [`ProcessState::Exited`] on the next call.
pub struct ProcessSupervisor {
    log: Arc<LogStore>,
    containment: Arc<dyn Containment>,
    state: Mutex<SessionState>,
    last_launch: Mutex<Option<LaunchSpec>>,
    stop_grace: Duration,
    restart_settle: Duration,
}

impl ProcessSupervisor {
    pub fn new(log: Arc<LogStore>, containment: Arc<dyn Containment>) -> Self {
        Self {
            log,
            containment,
            state: Mutex::new(SessionState::NotStarted),
            last_launch: Mutex::new(None),
            stop_grace: DEFAULT_STOP_GRACE,
            restart_settle: RESTART_SETTLE,
        }
    }

    /// Grace period used by [`restart`](Self::restart).
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Pause between stop and start during [`restart`](Self::restart).
    pub fn with_restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }

    pub fn log_store(&self) -> Arc<LogStore> {
        self.log.clone()
    }

    /// Launch `exe` in `working_dir` with no arguments.
    pub async fn start(&self, exe: &Path, working_dir: Option<&Path>) -> Result<u32, ProcessError> {
        self.start_with_args(exe, &[], working_dir).await
    }

    /// Launch the child and begin capturing its output. Returns the pid.
    pub async fn start_with_args(
        &self,
        exe: &Path,
        args: &[String],
        working_dir: Option<&Path>,
    ) -> Result<u32, ProcessError> {
        let spec = LaunchSpec {
            exe: exe.to_path_buf(),
            args: args.to_vec(),
            working_dir: working_dir.map(Path::to_path_buf),
        };
        self.launch(spec).await
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<u32, ProcessError> {
        let mut state = self.state.lock().await;
        refresh(&mut state);
        if let SessionState::Running(session) = &*state {
            return Err(ProcessError::AlreadyRunning { pid: session.pid });
        }

        if !spec.exe.is_file() {
            return Err(ProcessError::ExecutableNotFound {
                path: spec.exe.clone(),
            });
        }

        let mut command = Command::new(&spec.exe);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = spec.working_dir.as_deref() {
            command.current_dir(dir);
        }
        self.containment.prepare(&mut command);

        let spawn_err = |source: std::io::Error| ProcessError::Spawn {
            path: spec.exe.clone(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_err)?;
        let pid = child.id().unwrap_or_default();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Err(spawn_err(std::io::Error::other("child stdio was not captured")));
        };

        let readers = [
            spawn_reader(stdout, self.log.clone(), "stdout"),
            spawn_reader(stderr, self.log.clone(), "stderr"),
        ];

        tracing::info!(pid, exe = %spec.exe.display(), "server process started");
        *state = SessionState::Running(Session {
            child,
            stdin,
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            _readers: readers,
        });
        drop(state);

        *self.last_launch.lock().await = Some(spec);
        Ok(pid)
    }

    /// Ask the child to stop, killing it (and its process tree) once `grace`
    /// runs out. Returns `false` when nothing was running.
    pub async fn stop(&self, grace: Duration) -> bool {
        let mut state = self.state.lock().await;
        refresh(&mut state);
        if !matches!(*state, SessionState::Running(_)) {
            return false;
        }
        let SessionState::Running(mut session) =
            std::mem::replace(&mut *state, SessionState::NotStarted)
        else {
            return false;
        };

        let pid = session.pid;
        tracing::info!(pid, "stopping server process");
        if let Err(err) = write_line(&mut session.stdin, "stop").await {
            tracing::debug!(pid, error = %err, "stop command not delivered");
        }

        let exit_code = match tokio::time::timeout(grace, session.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(err)) => {
                tracing::warn!(pid, error = %err, "wait failed, killing server process");
                self.force_kill(&mut session).await
            }
            Err(_) => {
                tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "server ignored stop, killing");
                self.force_kill(&mut session).await
            }
        };

        tracing::info!(pid, exit_code = ?exit_code, "server process stopped");
        *state = session.into_exited(exit_code);
        true
    }

    async fn force_kill(&self, session: &mut Session) -> Option<i32> {
        if let Err(err) = self.containment.kill_tree(session.pid) {
            tracing::warn!(pid = session.pid, error = %err, "process tree kill failed");
        }
        if let Err(err) = session.child.kill().await {
            tracing::debug!(pid = session.pid, error = %err, "direct kill failed");
        }
        session.child.try_wait().ok().flatten().and_then(|s| s.code())
    }

    /// Start again with the parameters of the last successful launch.
    pub async fn relaunch(&self) -> Result<u32, ProcessError> {
        let spec = self
            .last_launch
            .lock()
            .await
            .clone()
            .ok_or(ProcessError::NeverStarted)?;
        self.launch(spec).await
    }

    /// Stop, pause, then start again with the last launch parameters.
    pub async fn restart(&self) -> bool {
        if self.last_launch.lock().await.is_none() {
            tracing::warn!(error = %ProcessError::NeverStarted, "restart skipped");
            return false;
        }

        self.stop(self.stop_grace).await;
        tokio::time::sleep(self.restart_settle).await;

        match self.relaunch().await {
            Ok(pid) => {
                tracing::info!(pid, "server process restarted");
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "server restart failed");
                false
            }
        }
    }

    /// Write one line to the child's stdin.
    pub async fn try_send_line(&self, line: &str) -> Result<(), ProcessError> {
        let mut state = self.state.lock().await;
        refresh(&mut state);
        let SessionState::Running(session) = &mut *state else {
            return Err(ProcessError::NotRunning);
        };
        write_line(&mut session.stdin, line)
            .await
            .map_err(|source| ProcessError::CommandSendFailed {
                line: line.to_string(),
                source,
            })
    }

    pub async fn send_line(&self, line: &str) -> bool {
        match self.try_send_line(line).await {
            Ok(()) => {
                tracing::debug!(line, "command sent");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "command not sent");
                false
            }
        }
    }

    /// Send `line` and wait up to `timeout` for the child to print anything.
    ///
    /// `None` when the line could not be sent.
    pub async fn send_line_and_await_response(
        &self,
        line: &str,
        timeout: Duration,
    ) -> Option<CommandResponse> {
        let offset = self.log.len();
        if !self.send_line(line).await {
            return None;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let fresh = self.log.since(offset);
            let fresh = fresh.trim();
            if !fresh.is_empty() {
                return Some(CommandResponse::Output(fresh.to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Some(CommandResponse::NoOutput);
            }
            tokio::time::sleep(RESPONSE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        refresh(&mut state);
        matches!(*state, SessionState::Running(_))
    }

    pub async fn pid(&self) -> Option<u32> {
        let mut state = self.state.lock().await;
        refresh(&mut state);
        match &*state {
            SessionState::Running(session) => Some(session.pid),
            _ => None,
        }
    }

    pub async fn status(&self) -> ProcessStatus {
        let mut state = self.state.lock().await;
        refresh(&mut state);

        let mut status = ProcessStatus {
            log_lines: self.log.line_count(),
            log_bytes: self.log.len(),
            ..Default::default()
        };
        match &*state {
            SessionState::NotStarted => {}
            SessionState::Running(session) => {
                status.state = ProcessState::Running;
                status.pid = Some(session.pid);
                status.started_at = Some(session.started_at);
                status.uptime_secs = Some(session.started.elapsed().as_secs());
                status.memory_rss_bytes = resident_memory_bytes(session.pid);
            }
            SessionState::Exited {
                pid,
                started_at,
                exit_code,
            } => {
                status.state = ProcessState::Exited;
                status.pid = Some(*pid);
                status.started_at = Some(*started_at);
                status.exit_code = *exit_code;
            }
        }
        status
    }
}

#[async_trait]
impl ServerConsole for ProcessSupervisor {
    async fn send_line(&self, line: &str) -> bool {
        ProcessSupervisor::send_line(self, line).await
    }

    async fn is_running(&self) -> bool {
        ProcessSupervisor::is_running(self).await
    }

    fn log(&self) -> &LogStore {
        &self.log
    }
}

/// Move a dead child from `Running` to `Exited`.
fn refresh(state: &mut SessionState) {
    let exit = match state {
        SessionState::Running(session) => match session.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(pid = session.pid, error = %err, "could not poll server process");
                None
            }
        },
        _ => None,
    };

    if let Some(exit_code) = exit {
        if let SessionState::Running(session) =
            std::mem::replace(state, SessionState::NotStarted)
        {
            tracing::info!(pid = session.pid, exit_code = ?exit_code, "server process exited");
            *state = session.into_exited(exit_code);
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

fn spawn_reader<R>(stream: R, log: Arc<LogStore>, name: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => log.append(&String::from_utf8_lossy(&buf)),
                Err(err) => {
                    tracing::debug!(stream = name, error = %err, "console reader stopped");
                    break;
                }
            }
        }
        tracing::debug!(stream = name, "console stream closed");
    })
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes(_pid: u32) -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}
