use super::mocks::{Journal, MockManager, RecordingConfigService, RecordingLatch};
use crate::{
    error::{KEY_FAILED, MigrationError, StepError},
    execution::{MigrationTask, MigrationTaskParams, TaskState},
};
use connectors::handle::DatabaseHandle;
use engine_config::settings::MigrationSettings;
use engine_core::event_bus::EventBus;
use model::{
    changelog::CHANGELOG_FILE,
    datasource::DataSourceConfiguration,
    events::migration::{MigrationCanceled, MigrationFailed, MigrationStarted, MigrationSucceeded},
};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::tempdir;
use tokio::sync::mpsc;

struct Fixture {
    task: Arc<MigrationTask>,
    journal: Journal,
    latch: Arc<RecordingLatch>,
    source: DatabaseHandle,
    config_service: Arc<RecordingConfigService>,
    events: EventBus,
}

#[derive(Default)]
struct Options {
    reused: bool,
    reject_acquire: bool,
    stall_drain: bool,
    fail_save: bool,
}

fn fixture(backup_dir: &Path, options: Options) -> Fixture {
    let journal = Journal::default();
    let source = DatabaseHandle::connect(DataSourceConfiguration::memory("source")).unwrap();
    let target = DatabaseHandle::connect(DataSourceConfiguration::memory("target")).unwrap();

    let mut latch = RecordingLatch::new(journal.clone(), &source);
    if options.stall_drain {
        latch = latch.stalling();
    }
    let latch = Arc::new(latch);

    let manager = Arc::new(MockManager {
        handle: source.clone(),
        latch: latch.clone(),
        reused: options.reused,
        reject_acquire: options.reject_acquire,
    });
    let config_service = Arc::new(RecordingConfigService {
        journal: journal.clone(),
        source: source.clone(),
        fail: options.fail_save,
        saved: Mutex::new(Vec::new()),
    });
    let events = EventBus::new();

    let task = Arc::new(MigrationTask::new(MigrationTaskParams {
        manager,
        target,
        config_service: config_service.clone(),
        events: events.clone(),
        settings: MigrationSettings::default(),
        backup_dir: backup_dir.to_path_buf(),
    }));

    Fixture {
        task,
        journal,
        latch,
        source,
        config_service,
        events,
    }
}

#[tokio::test]
async fn successful_migration_switches_to_target() {
    let dir = tempdir().unwrap();
    let f = fixture(dir.path(), Options::default());

    let (started_tx, mut started_rx) = mpsc::channel(4);
    let (succeeded_tx, mut succeeded_rx) = mpsc::channel(4);
    f.events.subscribe::<MigrationStarted>(started_tx).await;
    f.events.subscribe::<MigrationSucceeded>(succeeded_tx).await;

    f.task.run().await.unwrap();

    assert_eq!(f.task.state(), TaskState::Succeeded);
    assert_eq!(f.task.progress().percent, 100);
    assert_eq!(
        f.journal.entries(),
        vec!["drain", "save", "unlatch_to:target"]
    );
    assert!(f.source.is_closed());

    let started = started_rx.recv().await.unwrap();
    let succeeded = succeeded_rx.recv().await.unwrap();
    assert_eq!(started.endpoints.task_id, f.task.id());
    assert_eq!(succeeded.endpoints.target, "memory://target");
}

#[tokio::test]
async fn second_run_is_rejected() {
    let dir = tempdir().unwrap();
    let f = fixture(dir.path(), Options::default());

    f.task.run().await.unwrap();
    let err = f.task.run().await.unwrap_err();
    assert!(matches!(err, MigrationError::AlreadyStarted(_)));
    assert_eq!(f.task.state(), TaskState::Succeeded);
}

#[tokio::test]
async fn configuration_is_saved_before_source_is_closed() {
    let dir = tempdir().unwrap();
    let f = fixture(dir.path(), Options::default());

    f.task.run().await.unwrap();

    assert_eq!(f.journal.count("save"), 1);
    assert_eq!(f.journal.count("save_after_close"), 0);

    let saved = f.config_service.saved.lock().unwrap().clone();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, DataSourceConfiguration::memory("target"));
    assert_eq!(saved[0].1, Some(DataSourceConfiguration::memory("source")));

    // Finalize already closed the source; a further close is a no-op.
    assert!(!f.source.close().await.unwrap());
}

#[tokio::test]
async fn failed_save_reverts_and_keeps_source_open() {
    let dir = tempdir().unwrap();
    let f = fixture(
        dir.path(),
        Options {
            fail_save: true,
            ..Options::default()
        },
    );

    let (failed_tx, mut failed_rx) = mpsc::channel(4);
    f.events.subscribe::<MigrationFailed>(failed_tx).await;

    let err = f.task.run().await.unwrap_err();
    assert_eq!(err.message_key(), KEY_FAILED);
    assert!(matches!(
        err,
        MigrationError::Failed {
            source: StepError::ConfigStore(_),
            ..
        }
    ));
    assert_eq!(f.task.state(), TaskState::Failed);
    assert!(!f.source.is_closed());
    assert_eq!(
        f.journal.entries(),
        vec![
            "drain",
            "save_failed",
            "drain",
            "force_drain",
            "unlatch_to:source"
        ]
    );
    assert_eq!(failed_rx.recv().await.unwrap().message_key, KEY_FAILED);
}

#[tokio::test]
async fn reused_latch_is_not_drained() {
    let dir = tempdir().unwrap();
    let f = fixture(
        dir.path(),
        Options {
            reused: true,
            ..Options::default()
        },
    );

    f.task.run().await.unwrap();
    assert_eq!(f.journal.entries(), vec!["save", "unlatch_to:target"]);
}

#[tokio::test]
async fn reused_latch_revert_only_unlatches_to_source() {
    let dir = tempdir().unwrap();
    // An existing backup makes the backup phase fail.
    std::fs::write(dir.path().join(CHANGELOG_FILE), "{}").unwrap();
    let f = fixture(
        dir.path(),
        Options {
            reused: true,
            ..Options::default()
        },
    );

    let err = f.task.run().await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Failed {
            source: StepError::Io { .. },
            ..
        }
    ));
    assert_eq!(f.journal.entries(), vec!["unlatch_to:source"]);
}

#[tokio::test]
async fn cancel_while_draining_reverts_once() {
    let dir = tempdir().unwrap();
    let f = fixture(
        dir.path(),
        Options {
            stall_drain: true,
            ..Options::default()
        },
    );

    let (canceled_tx, mut canceled_rx) = mpsc::channel(4);
    f.events.subscribe::<MigrationCanceled>(canceled_tx).await;

    let drain_entered = f.latch.drain_entered.notified();
    let task = f.task.clone();
    let handle = tokio::spawn(async move { task.run().await });

    tokio::time::timeout(Duration::from_secs(5), drain_entered)
        .await
        .unwrap();
    f.task.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(f.task.state(), TaskState::Canceled);
    assert_eq!(
        f.journal.entries(),
        vec!["drain", "drain", "force_drain", "unlatch_to:source"]
    );
    assert_eq!(f.journal.count("unlatch_to:source"), 1);
    assert!(!f.source.is_closed());
    assert!(canceled_rx.recv().await.is_some());
}

#[tokio::test]
async fn cancel_before_run_never_touches_target() {
    let dir = tempdir().unwrap();
    let f = fixture(dir.path(), Options::default());

    f.task.cancel();
    let err = f.task.run().await.unwrap_err();

    assert!(err.is_canceled());
    assert_eq!(f.journal.count("save"), 0);
    assert_eq!(f.journal.count("unlatch_to:source"), 1);
    assert!(!dir.path().join(CHANGELOG_FILE).exists());
}

#[tokio::test]
async fn latch_failure_fails_without_revert() {
    let dir = tempdir().unwrap();
    let f = fixture(
        dir.path(),
        Options {
            reject_acquire: true,
            ..Options::default()
        },
    );

    let err = f.task.run().await.unwrap_err();
    assert!(matches!(err, MigrationError::Latch(_)));
    assert_eq!(f.task.state(), TaskState::Failed);
    assert!(f.journal.entries().is_empty());
}

#[tokio::test]
async fn state_changes_are_observable() {
    let dir = tempdir().unwrap();
    let f = fixture(dir.path(), Options::default());
    let mut states = f.task.subscribe();
    assert_eq!(*states.borrow_and_update(), TaskState::Created);

    f.task.run().await.unwrap();
    states.changed().await.unwrap();
    assert!(states.borrow().is_terminal());
    assert_eq!(TaskState::Succeeded.to_string(), "SUCCEEDED");
}

#[tokio::test]
async fn failing_migration_runs_on_a_spawned_task() {
    let dir = tempdir().unwrap();
    let f = fixture(
        dir.path(),
        Options {
            fail_save: true,
            ..Options::default()
        },
    );
    let (failed_tx, mut failed_rx) = mpsc::channel(4);
    f.events.subscribe::<MigrationFailed>(failed_tx).await;

    let task = f.task.clone();
    let err = tokio::spawn(async move { task.run().await })
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, MigrationError::Failed { .. }));
    let failed = failed_rx.recv().await.unwrap();
    assert_eq!(failed.message_key, KEY_FAILED);
    assert!(!failed.error.is_empty());
}
