//! Backup and restore on their own, without latching or switching databases.

use crate::execution::{
    KEY_BACKUP, KEY_RESTORE,
    backup::{BackupState, BackupStep},
    phase::Phase,
    restore::{RestoreState, RestoreStep},
};
use model::cancel::CancelState;
use std::sync::Arc;

/// Backup phase plus a handle on its step for the summary.
pub fn backup_task(state: BackupState, cancel: CancelState) -> (Phase, Arc<BackupStep>) {
    let step = Arc::new(BackupStep::new(state, cancel.child_token()));
    let phase = Phase::builder("backup", KEY_BACKUP, cancel)
        .step(step.clone(), 1)
        .build();
    (phase, step)
}

pub fn restore_task(state: RestoreState, cancel: CancelState) -> Phase {
    let step = RestoreStep::new(state, cancel.child_token());
    Phase::builder("restore", KEY_RESTORE, cancel)
        .step(Arc::new(step), 1)
        .build()
}
