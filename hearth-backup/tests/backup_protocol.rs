use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hearth_backup::{
    list_backups, BackupCoordinator, BackupError, BackupOutcome, BackupRun, ProtocolTimings,
    TriggerOutcome, SAVE_HOLD, SAVE_QUERY, SAVE_RESUME,
};
use hearth_core::{BackupConfiguration, LevelNameResolver};
use hearth_process::{LogStore, ServerConsole};
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};

const READY: &str = "Data saved. Files are now ready to be copied.";

/// Scripted stand-in for the server console.
#[derive(Default)]
struct FakeConsole {
    log: LogStore,
    sent: Mutex<Vec<String>>,
    stopped: AtomicBool,
    query_reply: Mutex<Vec<String>>,
    reject: Mutex<Option<&'static str>>,
}

impl FakeConsole {
    fn replying(lines: &[&str]) -> Arc<Self> {
        let console = Self::default();
        *console.query_reply.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
        Arc::new(console)
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn count(&self, command: &str) -> usize {
        self.sent().iter().filter(|line| *line == command).count()
    }
}

#[async_trait]
impl ServerConsole for FakeConsole {
    async fn send_line(&self, line: &str) -> bool {
        if self.stopped.load(Ordering::SeqCst) || *self.reject.lock().unwrap() == Some(line) {
            return false;
        }
        self.sent.lock().unwrap().push(line.to_string());
        if line == SAVE_QUERY {
            for reply in self.query_reply.lock().unwrap().iter() {
                self.log.append(reply);
            }
        }
        true
    }

    async fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    fn log(&self) -> &LogStore {
        &self.log
    }
}

struct Fixture {
    _tmp: TempDir,
    world: PathBuf,
    backups: PathBuf,
    config_tx: watch::Sender<BackupConfiguration>,
    shutdown_tx: broadcast::Sender<()>,
    coordinator: Arc<BackupCoordinator>,
}

fn fixture(console: Arc<FakeConsole>, timings: ProtocolTimings, world_files: &[&str]) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let world = tmp.path().join("worlds").join("MyWorld");
    for file in world_files {
        let path = world.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("bytes of {file}")).unwrap();
    }
    let backups = tmp.path().join("backups");

    let config = BackupConfiguration {
        frequency_minutes: 30,
        backup_directory: backups.clone(),
        max_backups_to_keep: 2,
        world_path: Some(world.clone()),
    };
    let (config_tx, config_rx) = watch::channel(config);
    let (shutdown_tx, _) = broadcast::channel(4);

    let coordinator = BackupCoordinator::new(
        console,
        Arc::new(LevelNameResolver::fixed("MyWorld")),
        config_rx,
        shutdown_tx.clone(),
    )
    .with_timings(timings);

    Fixture {
        _tmp: tmp,
        world,
        backups,
        config_tx,
        shutdown_tx,
        coordinator: Arc::new(coordinator),
    }
}

async fn completed(coordinator: &BackupCoordinator) -> BackupRun {
    match coordinator.trigger_manual().await {
        TriggerOutcome::Completed(run) => run,
        TriggerOutcome::AlreadyRunning => panic!("unexpected AlreadyRunning"),
    }
}

fn backup_names(root: &Path) -> Vec<String> {
    list_backups(root)
        .unwrap()
        .into_iter()
        .map(|b| b.name)
        .collect()
}

#[tokio::test]
async fn successful_run_copies_manifest_files() {
    let console = FakeConsole::replying(&[READY, "MyWorld/db/000001.ldb:100, MyWorld/db/000002.ldb:50"]);
    let fx = fixture(
        console.clone(),
        ProtocolTimings::fast(),
        &["db/000001.ldb", "db/000002.ldb", "db/LOCK"],
    );

    let run = completed(&fx.coordinator).await;

    assert!(matches!(run.outcome, BackupOutcome::Succeeded), "{:?}", run.outcome);
    assert_eq!((run.files, run.copied, run.failed), (2, 2, 0));
    assert!(run.resumed);
    assert_eq!(console.sent(), vec![SAVE_HOLD, SAVE_QUERY, SAVE_RESUME]);

    let dir = run.directory.expect("backup directory");
    assert!(dir.starts_with(&fx.backups));
    assert!(dir.file_name().unwrap().to_str().unwrap().starts_with("backup_"));
    assert_eq!(
        fs::read_to_string(dir.join("db/000001.ldb")).unwrap(),
        "bytes of db/000001.ldb"
    );
    assert!(!dir.join("db/LOCK").exists(), "only manifest files are copied");
}

#[tokio::test]
async fn partial_copy_is_still_a_success() {
    let console = FakeConsole::replying(&[
        READY,
        "MyWorld/a.ldb:1, MyWorld/b.ldb:1, MyWorld/c.ldb:1, MyWorld/d.ldb:1, MyWorld/e.ldb:1",
    ]);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["a.ldb", "b.ldb", "c.ldb"]);

    let run = completed(&fx.coordinator).await;

    assert!(matches!(run.outcome, BackupOutcome::PartialSuccess));
    assert!(run.is_success());
    assert_eq!((run.copied, run.failed), (3, 2));
    assert_eq!(console.count(SAVE_RESUME), 1);
}

#[tokio::test]
async fn no_copied_files_fails_the_run() {
    let console = FakeConsole::replying(&[READY, "MyWorld/gone.ldb:1"]);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &[]);

    let run = completed(&fx.coordinator).await;

    assert!(matches!(
        run.error(),
        Some(BackupError::NoFilesCopied { failed: 1 })
    ));
    assert!(run.pruned.is_none(), "retention skipped when nothing copied");
    assert_eq!(console.count(SAVE_RESUME), 1);
}

#[tokio::test]
async fn hold_failure_aborts_without_resume() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    console.stopped.store(true, Ordering::SeqCst);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["level.dat"]);

    let run = completed(&fx.coordinator).await;

    assert!(matches!(run.error(), Some(BackupError::ProcessNotRunning)));
    assert!(!run.resumed);
    assert!(console.sent().is_empty());
    assert!(backup_names(&fx.backups).is_empty());
}

#[tokio::test]
async fn query_send_failure_still_resumes() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    *console.reject.lock().unwrap() = Some(SAVE_QUERY);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["level.dat"]);

    let run = completed(&fx.coordinator).await;

    assert!(matches!(
        run.error(),
        Some(BackupError::CommandSendFailed { command }) if command == SAVE_QUERY
    ));
    assert_eq!(console.sent(), vec![SAVE_HOLD, SAVE_RESUME]);
}

#[tokio::test]
async fn empty_manifest_still_resumes() {
    let console = FakeConsole::replying(&[READY]);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["level.dat"]);

    let run = completed(&fx.coordinator).await;

    assert!(matches!(run.error(), Some(BackupError::ManifestEmpty { level }) if level == "MyWorld"));
    assert_eq!(console.count(SAVE_RESUME), 1);
    assert!(backup_names(&fx.backups).is_empty());
}

#[tokio::test]
async fn marker_from_before_the_query_is_ignored() {
    let console = FakeConsole::replying(&[]);
    console.log.append(READY);
    console.log.append("MyWorld/level.dat:1");
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["level.dat"]);

    let run = completed(&fx.coordinator).await;

    assert!(matches!(
        run.error(),
        Some(BackupError::SaveQuerySignalTimeout { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn signal_timeout_resumes_once_and_creates_nothing() {
    let console = FakeConsole::replying(&[]);
    let fx = fixture(console.clone(), ProtocolTimings::default(), &["level.dat"]);

    let started = tokio::time::Instant::now();
    let run = completed(&fx.coordinator).await;

    assert!(matches!(
        run.error(),
        Some(BackupError::SaveQuerySignalTimeout { waited }) if *waited == Duration::from_secs(10)
    ));
    // 3s hold settle + 10s signal window.
    assert!(started.elapsed() >= Duration::from_secs(13));
    assert_eq!(console.count(SAVE_RESUME), 1);
    assert!(!fx.backups.exists() || backup_names(&fx.backups).is_empty());
}

#[tokio::test]
async fn concurrent_manual_triggers_run_once() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["level.dat"]);

    let (first, second) = tokio::join!(
        fx.coordinator.trigger_manual(),
        fx.coordinator.trigger_manual()
    );

    let already = [&first, &second]
        .iter()
        .filter(|o| matches!(o, TriggerOutcome::AlreadyRunning))
        .count();
    assert_eq!(already, 1);
    assert_eq!(console.count(SAVE_HOLD), 1);
    assert_eq!(console.count(SAVE_RESUME), 1);
}

#[tokio::test]
async fn retention_keeps_the_newest_backups() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:2048"]);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["level.dat"]);

    let mut directories = Vec::new();
    for _ in 0..3 {
        let run = completed(&fx.coordinator).await;
        assert!(run.is_success());
        directories.push(run.directory.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let remaining: Vec<PathBuf> = list_backups(&fx.backups)
        .unwrap()
        .into_iter()
        .map(|b| b.path)
        .collect();
    assert_eq!(remaining, vec![directories[2].clone(), directories[1].clone()]);
    assert!(!directories[0].exists(), "oldest backup deleted");
    assert_eq!(console.count(SAVE_RESUME), 3);
}

#[tokio::test]
async fn shutdown_during_settle_skips_to_resume() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    let timings = ProtocolTimings {
        hold_settle: Duration::from_secs(30),
        ..ProtocolTimings::fast()
    };
    let fx = fixture(console.clone(), timings, &["level.dat"]);

    let coordinator = fx.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.trigger_manual().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = fx.shutdown_tx.send(());

    let TriggerOutcome::Completed(run) = handle.await.unwrap() else {
        panic!("run should have started");
    };
    assert!(matches!(run.error(), Some(BackupError::Cancelled)));
    assert_eq!(console.sent(), vec![SAVE_HOLD, SAVE_RESUME]);
}

#[tokio::test]
async fn config_change_mid_run_keeps_the_run_snapshot() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    let timings = ProtocolTimings {
        hold_settle: Duration::from_millis(300),
        ..ProtocolTimings::fast()
    };
    let fx = fixture(console.clone(), timings, &["level.dat"]);
    let elsewhere = fx.backups.with_file_name("elsewhere");

    let coordinator = fx.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.trigger_manual().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.config_tx.send_modify(|config| {
        config.backup_directory = elsewhere.clone();
        config.max_backups_to_keep = 1;
    });

    let TriggerOutcome::Completed(run) = handle.await.unwrap() else {
        panic!("run should have started");
    };
    assert!(run.is_success(), "{:?}", run.outcome);
    assert_eq!(console.count(SAVE_HOLD), 1);
    assert_eq!(console.count(SAVE_RESUME), 1);
    assert!(run.directory.unwrap().starts_with(&fx.backups));
    assert!(!elsewhere.exists());
    assert_eq!(fx.coordinator.configuration().backup_directory, elsewhere);
}

#[tokio::test]
async fn begin_restore_checks_name_and_guard_first() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    let timings = ProtocolTimings {
        hold_settle: Duration::from_millis(300),
        ..ProtocolTimings::fast()
    };
    let fx = fixture(console.clone(), timings, &["level.dat"]);
    let name = "backup_2024-05-01_12-00-00";
    fs::create_dir_all(fx.backups.join(name)).unwrap();

    assert!(matches!(
        fx.coordinator.begin_restore("backup_typo"),
        Err(BackupError::BackupNotFound { .. })
    ));
    assert!(matches!(
        fx.coordinator.begin_restore("../worlds"),
        Err(BackupError::InvalidBackupName { .. })
    ));
    assert!(console.sent().is_empty());

    let coordinator = fx.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.trigger_manual().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(
        fx.coordinator.begin_restore(name),
        Err(BackupError::AlreadyRunning)
    ));
    assert!(matches!(handle.await.unwrap(), TriggerOutcome::Completed(_)));

    let ticket = fx.coordinator.begin_restore(name).expect("guard released");
    assert_eq!(ticket.name(), name);
    assert!(matches!(
        fx.coordinator.trigger_manual().await,
        TriggerOutcome::AlreadyRunning
    ));
}

#[tokio::test]
async fn restore_requires_stopped_server() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    let fx = fixture(console.clone(), ProtocolTimings::fast(), &["level.dat"]);
    let run = completed(&fx.coordinator).await;
    let name = run
        .directory
        .unwrap()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();

    let err = fx.coordinator.restore(&name).await.unwrap_err();
    assert!(matches!(err, BackupError::ServerRunning));

    fs::write(fx.world.join("level.dat"), "newer").unwrap();
    console.stopped.store(true, Ordering::SeqCst);
    let report = fx.coordinator.restore(&name).await.unwrap();

    assert_eq!(report.files_restored, 1);
    assert_eq!(
        fs::read_to_string(fx.world.join("level.dat")).unwrap(),
        "bytes of level.dat"
    );
    assert!(report.previous_world.unwrap().join("level.dat").is_file());
}

#[tokio::test]
async fn catalogue_lists_and_deletes() {
    let console = FakeConsole::replying(&[READY, "MyWorld/level.dat:1"]);
    let fx = fixture(console, ProtocolTimings::fast(), &["level.dat"]);
    completed(&fx.coordinator).await;

    let listed = fx.coordinator.list_backups().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].size_bytes > 0);

    fx.coordinator.delete_backup(&listed[0].name).await.unwrap();
    assert!(fx.coordinator.list_backups().await.unwrap().is_empty());

    let err = fx.coordinator.delete_backup("../etc").await.unwrap_err();
    assert!(matches!(err, BackupError::InvalidBackupName { .. }));
}

#[tokio::test(start_paused = true)]
async fn config_change_wakes_the_sleeping_scheduler() {
    let console = FakeConsole::replying(&[]);
    let fx = fixture(console.clone(), ProtocolTimings::default(), &["level.dat"]);

    let coordinator = fx.coordinator.clone();
    let scheduler = tokio::spawn(async move { coordinator.run_schedule().await });

    // Startup delay (30s) is over; the loop is sleeping toward t=30min.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(console.sent().is_empty());

    fx.config_tx.send_modify(|config| config.frequency_minutes = 1);

    // 1s backoff then a 60s sleep: the hold lands at t=101s.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(console.count(SAVE_HOLD), 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(console.count(SAVE_HOLD), 1);

    let _ = fx.shutdown_tx.send(());
    scheduler.await.unwrap();
    assert_eq!(console.count(SAVE_RESUME), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_pauses_the_scheduler() {
    let console = FakeConsole::replying(&[]);
    let fx = fixture(console.clone(), ProtocolTimings::default(), &["level.dat"]);
    fx.config_tx.send_modify(|config| config.frequency_minutes = 0);

    let coordinator = fx.coordinator.clone();
    let scheduler = tokio::spawn(async move { coordinator.run_schedule().await });

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(console.sent().is_empty());

    let _ = fx.shutdown_tx.send(());
    scheduler.await.unwrap();
}
