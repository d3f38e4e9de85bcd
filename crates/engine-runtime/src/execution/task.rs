use crate::{
    error::{KEY_CANCELED, KEY_FAILED, MigrationError},
    execution::{
        KEY_BACKUP, KEY_FINALIZE, KEY_MAINTENANCE, KEY_MIGRATION, KEY_RESTORE,
        backup::{BackupState, BackupStep},
        finalize::FinalizeStep,
        maintenance::MaintenanceStep,
        phase::Phase,
        restore::{RestoreState, RestoreStep},
        step::Step,
    },
};
use chrono::Utc;
use connectors::handle::DatabaseHandle;
use engine_config::settings::MigrationSettings;
use engine_core::{
    database::{DatabaseLatch, DatabaseManager},
    event_bus::EventBus,
    latch::LatchMode,
    progress::Progress,
    state::ConfigurationService,
};
use model::{
    cancel::{CancelState, Canceled, is_cancellation},
    events::migration::{
        MigrationCanceled, MigrationEndpoints, MigrationFailed, MigrationStarted,
        MigrationSucceeded,
    },
};
use std::{
    fmt,
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Canceled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "CREATED",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

pub struct MigrationTaskParams {
    pub manager: Arc<dyn DatabaseManager>,
    pub target: DatabaseHandle,
    pub config_service: Arc<dyn ConfigurationService>,
    pub events: EventBus,
    pub settings: MigrationSettings,
    /// Directory the intermediate backup is written to.
    pub backup_dir: PathBuf,
}

/// Moves the application from the manager's current database to `target`.
///
/// Runs maintenance, backup, restore and finalize in that order while holding
/// the manager's latch. On success the latch is released onto the target. On
/// failure or cancellation the revert path returns control to the source.
pub struct MigrationTask {
    id: String,
    manager: Arc<dyn DatabaseManager>,
    source: DatabaseHandle,
    target: DatabaseHandle,
    config_service: Arc<dyn ConfigurationService>,
    events: EventBus,
    settings: MigrationSettings,
    backup_dir: PathBuf,
    cancel: CancelState,
    state: watch::Sender<TaskState>,
    plan: OnceLock<Arc<Phase>>,
    started: AtomicBool,
    reverted: AtomicBool,
}

impl MigrationTask {
    pub fn new(params: MigrationTaskParams) -> Self {
        let source = params.manager.handle();
        let (state, _) = watch::channel(TaskState::Created);
        MigrationTask {
            id: Uuid::new_v4().to_string(),
            manager: params.manager,
            source,
            target: params.target,
            config_service: params.config_service,
            events: params.events,
            settings: params.settings,
            backup_dir: params.backup_dir,
            cancel: CancelState::new(),
            state,
            plan: OnceLock::new(),
            started: AtomicBool::new(false),
            reverted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Receives every state transition.
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub fn progress(&self) -> Progress {
        if self.state() == TaskState::Succeeded {
            return Progress::new(KEY_MIGRATION, 100);
        }
        self.plan
            .get()
            .map(|plan| plan.progress())
            .unwrap_or_else(|| Progress::idle(KEY_MIGRATION))
    }

    /// Requests cancellation. Running steps unwind at their next row or change.
    pub fn cancel(&self) {
        info!(task_id = %self.id, "Cancellation requested");
        self.cancel.cancel();
        if let Some(plan) = self.plan.get() {
            plan.cancel();
        }
    }

    fn set_state(&self, state: TaskState) {
        self.state.send_replace(state);
    }

    fn endpoints(&self) -> MigrationEndpoints {
        MigrationEndpoints {
            task_id: self.id.clone(),
            source: self.source.describe(),
            target: self.target.describe(),
        }
    }

    fn build_plan(&self, latch: Arc<dyn DatabaseLatch>, owns_latch: bool) -> Phase {
        let root = self.cancel.child_token();
        let weights = self.settings.phases;
        let latch_settings = &self.settings.latch;

        let maintenance = single_step_phase("maintenance", KEY_MAINTENANCE, &root, |cancel| {
            Arc::new(MaintenanceStep::new(
                latch,
                owns_latch,
                latch_settings.drain_timeout(),
                latch_settings.force_drain_timeout(),
                cancel,
            ))
        });
        let backup = single_step_phase("backup", KEY_BACKUP, &root, |cancel| {
            Arc::new(BackupStep::new(
                BackupState {
                    source: self.source.clone(),
                    dir: self.backup_dir.clone(),
                    settings: self.settings.backup.clone(),
                },
                cancel,
            ))
        });
        let restore = single_step_phase("restore", KEY_RESTORE, &root, |cancel| {
            Arc::new(RestoreStep::new(
                RestoreState {
                    target: self.target.clone(),
                    dir: self.backup_dir.clone(),
                },
                cancel,
            ))
        });
        let finalize = single_step_phase("finalize", KEY_FINALIZE, &root, |cancel| {
            Arc::new(FinalizeStep::new(
                self.config_service.clone(),
                self.source.clone(),
                self.target.clone(),
                cancel,
            ))
        });

        Phase::builder("migration", KEY_MIGRATION, root)
            .step(maintenance, weights.maintenance)
            .step(backup, weights.backup)
            .step(restore, weights.restore)
            .step(finalize, weights.finalize)
            .build()
    }

    pub async fn run(&self) -> Result<(), MigrationError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(MigrationError::AlreadyStarted(self.id.clone()));
        }

        let started_at = Instant::now();
        self.set_state(TaskState::Running);
        info!(
            task_id = %self.id,
            from = %self.source.describe(),
            to = %self.target.describe(),
            "Migration started"
        );
        self.events
            .publish(MigrationStarted {
                endpoints: self.endpoints(),
                message_key: "migration.started".into(),
                timestamp: Utc::now(),
            })
            .await;

        let (latch, owns_latch) = match self.manager.current_latch() {
            Some(latch) => {
                info!(task_id = %self.id, latch_id = latch.id(), "Reusing existing latch");
                (latch, false)
            }
            None => match self.manager.acquire_latch(LatchMode::Local, None).await {
                Ok(latch) => (latch, true),
                Err(err) => {
                    let err = MigrationError::from(err);
                    error!(task_id = %self.id, error = %err, "Could not latch the database");
                    self.set_state(TaskState::Failed);
                    self.publish_failed(err.message_key(), err.to_string()).await;
                    return Err(err);
                }
            },
        };

        let plan = Arc::new(self.build_plan(latch.clone(), owns_latch));
        if self.plan.set(plan.clone()).is_err() {
            return Err(MigrationError::AlreadyStarted(self.id.clone()));
        }
        if self.cancel.is_cancelled() {
            plan.cancel();
        }

        match plan.run().await {
            Ok(()) => {
                latch.unlatch_to(self.target.clone()).await;
                self.set_state(TaskState::Succeeded);

                let duration_ms = started_at.elapsed().as_millis() as u64;
                info!(task_id = %self.id, duration_ms, "Migration succeeded");
                self.events
                    .publish(MigrationSucceeded {
                        endpoints: self.endpoints(),
                        message_key: "migration.succeeded".into(),
                        duration_ms,
                        timestamp: Utc::now(),
                    })
                    .await;
                Ok(())
            }
            Err(err) => {
                self.revert(latch.as_ref(), owns_latch).await;

                if is_cancellation(&err) {
                    warn!(task_id = %self.id, "Migration canceled");
                    self.set_state(TaskState::Canceled);
                    self.events
                        .publish(MigrationCanceled {
                            endpoints: self.endpoints(),
                            message_key: KEY_CANCELED.into(),
                            timestamp: Utc::now(),
                        })
                        .await;
                    Err(MigrationError::Canceled(Canceled))
                } else {
                    error!(task_id = %self.id, error = %err, "Migration failed");
                    self.set_state(TaskState::Failed);
                    self.publish_failed(KEY_FAILED, err.to_string()).await;
                    Err(MigrationError::Failed {
                        message_key: KEY_FAILED,
                        source: err,
                    })
                }
            }
        }
    }

    /// Hands the database back to the source. Runs at most once.
    ///
    /// Only a latch this task created is drained here; a reused latch is
    /// drained by whoever created it.
    async fn revert(&self, latch: &dyn DatabaseLatch, owns_latch: bool) {
        if self.reverted.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(task_id = %self.id, latch_id = latch.id(), owns_latch, "Reverting to source database");

        if owns_latch {
            let latch_settings = &self.settings.latch;
            let drained = latch.drain(latch_settings.drain_timeout()).await;
            let forced = latch.force_drain(latch_settings.force_drain_timeout()).await;
            if !forced {
                warn!(
                    task_id = %self.id,
                    drained,
                    "Operations still hold the database while reverting"
                );
            }
        }

        latch.unlatch_to(self.source.clone()).await;
    }

    async fn publish_failed(&self, message_key: &str, error: String) {
        self.events
            .publish(MigrationFailed {
                endpoints: self.endpoints(),
                message_key: message_key.to_string(),
                error,
                timestamp: Utc::now(),
            })
            .await;
    }
}

fn single_step_phase(
    name: &str,
    message_key: &str,
    parent: &CancelState,
    step: impl FnOnce(CancelState) -> Arc<dyn Step>,
) -> Arc<dyn Step> {
    let cancel = parent.child_token();
    let step = step(cancel.child_token());
    Arc::new(Phase::builder(name, message_key, cancel).step(step, 1).build())
}
