use model::changelog::ChangeSet;
use serde::Serialize;
use std::{
    fmt,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tracing::debug;

/// What a step, a phase or a whole task reports to whoever is polling it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub message_key: String,
    pub percent: u8,
}

impl Progress {
    pub fn new(message_key: impl Into<String>, percent: u64) -> Self {
        Progress {
            message_key: message_key.into(),
            percent: percent.min(100) as u8,
        }
    }

    pub fn idle(message_key: impl Into<String>) -> Self {
        Self::new(message_key, 0)
    }

    pub fn is_complete(&self) -> bool {
        self.percent >= 100
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:>3}%", self.message_key, self.percent)
    }
}

/// Receives row-level progress while a backup is exported.
pub trait BackupMonitor: Send + Sync {
    fn started(&self, total_rows: u64);

    /// Called once per exported row.
    fn row_written(&self);
}

/// Receives changeset-level progress while a restore is applied.
pub trait RestoreMonitor: Send + Sync {
    fn on_begin_change_set(&self, change_set: &ChangeSet, index: usize, total: usize);

    /// Called once per row-level change applied in the current changeset.
    fn on_applied_change(&self);

    fn on_finished_change_set(&self);
}

/// Rows written over rows announced.
#[derive(Debug, Default)]
pub struct BackupProgress {
    started: AtomicBool,
    total: AtomicU64,
    written: AtomicU64,
}

impl BackupProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn percent(&self) -> u8 {
        if !self.started.load(Ordering::Acquire) {
            return 0;
        }
        let total = self.total.load(Ordering::Acquire);
        if total == 0 {
            return 100;
        }
        let written = self.written.load(Ordering::Acquire).min(total);
        (written * 100 / total) as u8
    }
}

impl BackupMonitor for BackupProgress {
    fn started(&self, total_rows: u64) {
        self.written.store(0, Ordering::Release);
        self.total.store(total_rows, Ordering::Release);
        self.started.store(true, Ordering::Release);
        debug!(total_rows, "Backup export started");
    }

    fn row_written(&self) {
        self.written.fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Sum of the weights of every finished changeset.
    completed: u64,
    weight: u64,
    change_count: u64,
    applied: u64,
    percent: u8,
}

/// Restore progress where each changeset contributes its declared weight.
///
/// While changeset `i` is running it contributes
/// `weight_i * applied / change_count_i` (truncated). Finishing it snaps its
/// contribution to exactly `weight_i`, so truncation never accumulates and a
/// changelog whose weights sum to 100 ends at exactly 100. The reported value
/// never decreases.
#[derive(Debug, Default)]
pub struct WeightedProgressTracker {
    state: Mutex<TrackerState>,
}

impl WeightedProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn percent(&self) -> u8 {
        self.lock().percent
    }

    fn publish(state: &mut TrackerState, value: u64) {
        let value = value.min(100) as u8;
        state.percent = state.percent.max(value);
    }
}

impl RestoreMonitor for WeightedProgressTracker {
    fn on_begin_change_set(&self, change_set: &ChangeSet, index: usize, total: usize) {
        let mut state = self.lock();
        state.weight = u64::from(change_set.weight);
        state.change_count = change_set.change_count;
        state.applied = 0;
        debug!(
            change_set = %change_set.id,
            index,
            total,
            weight = change_set.weight,
            change_count = change_set.change_count,
            "Applying changeset"
        );
    }

    fn on_applied_change(&self) {
        let mut state = self.lock();
        if state.applied < state.change_count {
            state.applied += 1;
        }
        let partial = if state.change_count == 0 {
            0
        } else {
            state.weight * state.applied / state.change_count
        };
        let value = state.completed + partial;
        Self::publish(&mut state, value);
    }

    fn on_finished_change_set(&self) {
        let mut state = self.lock();
        state.completed += state.weight;
        state.weight = 0;
        state.change_count = 0;
        state.applied = 0;
        let value = state.completed;
        Self::publish(&mut state, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_set(id: &str, change_count: u64, weight: u32) -> ChangeSet {
        let mut cs = ChangeSet::new(id, "test", Vec::new());
        cs.change_count = change_count;
        cs.weight = weight;
        cs
    }

    #[test]
    fn weighted_sequence_snaps_on_finish() {
        let tracker = WeightedProgressTracker::new();
        let sets = [
            change_set("a", 4, 30),
            change_set("b", 2, 10),
            change_set("c", 10, 60),
        ];

        let mut seen = vec![tracker.percent()];
        for (index, cs) in sets.iter().enumerate() {
            tracker.on_begin_change_set(cs, index, sets.len());
            for _ in 0..cs.change_count {
                tracker.on_applied_change();
                seen.push(tracker.percent());
            }
            tracker.on_finished_change_set();
            seen.push(tracker.percent());
        }
        seen.dedup();

        assert_eq!(
            seen,
            vec![0, 7, 15, 22, 30, 35, 40, 46, 52, 58, 64, 70, 76, 82, 88, 94, 100]
        );
    }

    #[test]
    fn finishing_corrects_truncation_drift() {
        let tracker = WeightedProgressTracker::new();
        let cs = change_set("odd", 3, 10);
        tracker.on_begin_change_set(&cs, 0, 1);
        tracker.on_applied_change();
        tracker.on_applied_change();
        assert_eq!(tracker.percent(), 6);

        // Stray extra calls never push past the declared weight.
        tracker.on_applied_change();
        tracker.on_applied_change();
        assert_eq!(tracker.percent(), 10);

        tracker.on_finished_change_set();
        assert_eq!(tracker.percent(), 10);
    }

    #[test]
    fn empty_change_set_contributes_on_finish() {
        let tracker = WeightedProgressTracker::new();
        let cs = change_set("schema", 0, 5);
        tracker.on_begin_change_set(&cs, 0, 1);
        assert_eq!(tracker.percent(), 0);
        tracker.on_finished_change_set();
        assert_eq!(tracker.percent(), 5);
    }

    #[test]
    fn overweight_changelog_is_clamped() {
        let tracker = WeightedProgressTracker::new();
        for (i, weight) in [80, 80].into_iter().enumerate() {
            tracker.on_begin_change_set(&change_set("x", 1, weight), i, 2);
            tracker.on_applied_change();
            tracker.on_finished_change_set();
        }
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn backup_progress_counts_rows() {
        let progress = BackupProgress::new();
        assert_eq!(progress.percent(), 0);

        progress.started(4);
        progress.row_written();
        assert_eq!(progress.percent(), 25);
        for _ in 0..5 {
            progress.row_written();
        }
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn backup_of_empty_database_is_complete() {
        let progress = BackupProgress::new();
        progress.started(0);
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn progress_clamps_and_formats() {
        let progress = Progress::new("migration.backup", 250);
        assert!(progress.is_complete());
        assert_eq!(progress.to_string(), "migration.backup 100%");
    }
}
