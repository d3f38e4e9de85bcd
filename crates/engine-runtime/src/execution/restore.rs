use crate::{
    error::StepError,
    execution::{KEY_RESTORE, step::Step},
};
use async_trait::async_trait;
use connectors::{
    accessor::{ChangelogAccessor, with_lock},
    handle::DatabaseHandle,
};
use engine_core::{
    deferred::Deferred,
    progress::{Progress, RestoreMonitor, WeightedProgressTracker},
};
use model::{
    cancel::{self, CancelState},
    changelog::{
        BLOB_DIR, CHANGELOG_FILE, ChangeEntry, ChangeSet, ChangelogDocument, DeleteChange,
        InsertChange, StoredField, StoredValue, UpdateChange,
    },
    core::value::{FieldValue, Value},
};
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Where a restore reads the changelog from and which database it fills.
#[derive(Debug, Clone)]
pub struct RestoreState {
    pub target: DatabaseHandle,
    pub dir: PathBuf,
}

/// Reads and validates the changelog of a backup directory.
pub async fn load_changelog(dir: &Path) -> Result<ChangelogDocument, StepError> {
    let path = dir.join(CHANGELOG_FILE);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| StepError::io(&path, e))?;
    let document: ChangelogDocument = serde_json::from_slice(&bytes)?;
    document.validate()?;
    Ok(document)
}

/// Reads a blob and checks it still hashes to its id.
pub async fn read_blob(dir: &Path, id: &str, len: u64) -> Result<Vec<u8>, StepError> {
    if id.len() != 64 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StepError::Blob {
            id: id.to_string(),
            reason: "not a content id".into(),
        });
    }

    let path = dir.join(BLOB_DIR).join(id);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| StepError::io(&path, e))?;
    if bytes.len() as u64 != len || blake3::hash(&bytes).to_hex().as_str() != id {
        return Err(StepError::Blob {
            id: id.to_string(),
            reason: "content does not match its id".into(),
        });
    }
    Ok(bytes)
}

/// Applies a changelog to the target database under its schema lock.
///
/// Each changeset is bracketed by begin/end and rolled back if any change in
/// it fails, so a failed restore never leaves a half-applied changeset. The
/// cancel state is checked before every change.
pub struct RestoreStep {
    state: RestoreState,
    cancel: CancelState,
    tracker: Arc<WeightedProgressTracker>,
    document: Mutex<Deferred<Arc<ChangelogDocument>>>,
    done: AtomicBool,
}

impl RestoreStep {
    pub fn new(state: RestoreState, cancel: CancelState) -> Self {
        RestoreStep {
            state,
            cancel,
            tracker: Arc::new(WeightedProgressTracker::new()),
            document: Mutex::new(Deferred::Unresolved),
            done: AtomicBool::new(false),
        }
    }

    /// The changelog, loaded on first use.
    pub async fn document(&self) -> Result<Arc<ChangelogDocument>, StepError> {
        let mut slot = self.document.lock().await;
        let document = slot
            .get_or_resolve(|| async { load_changelog(&self.state.dir).await.map(Arc::new) })
            .await?;
        Ok(document.clone())
    }

    async fn apply(
        &self,
        accessor: &dyn ChangelogAccessor,
        document: &ChangelogDocument,
    ) -> Result<(), StepError> {
        let total = document.change_sets.len();
        for (index, change_set) in document.change_sets.iter().enumerate() {
            cancel::check(&self.cancel)?;
            self.tracker
                .on_begin_change_set(change_set, index, total);

            accessor.begin_change_set().await?;
            let result = match self.apply_change_set(accessor, change_set).await {
                Ok(()) => accessor.end_change_set().await.map_err(StepError::from),
                Err(err) => Err(err),
            };

            if let Err(err) = result {
                warn!(change_set = %change_set.id, error = %err, "Rolling back changeset");
                if let Err(rollback) = accessor.rollback_change_set().await {
                    warn!(change_set = %change_set.id, error = %rollback, "Rollback failed");
                }
                return Err(err);
            }

            self.tracker.on_finished_change_set();
            debug!(change_set = %change_set.id, "Changeset applied");
        }

        for change in accessor.find_custom_changes() {
            cancel::check(&self.cancel)?;
            info!(change = change.id(), "Running custom change");
            change.execute(accessor).await?;
        }
        Ok(())
    }

    async fn apply_change_set(
        &self,
        accessor: &dyn ChangelogAccessor,
        change_set: &ChangeSet,
    ) -> Result<(), StepError> {
        for entry in &change_set.changes {
            cancel::check(&self.cancel)?;
            self.apply_entry(accessor, entry).await?;
            self.tracker.on_applied_change();
        }
        Ok(())
    }

    async fn apply_entry(
        &self,
        accessor: &dyn ChangelogAccessor,
        entry: &ChangeEntry,
    ) -> Result<(), StepError> {
        match entry {
            ChangeEntry::CreateTable { schema } => {
                accessor.create_schema(std::slice::from_ref(schema)).await?
            }
            ChangeEntry::Insert { table, values } => {
                let change = InsertChange {
                    table: table.clone(),
                    values: self.resolve(values).await?,
                };
                accessor.insert(&change).await?
            }
            ChangeEntry::Update { table, key, values } => {
                let change = UpdateChange {
                    table: table.clone(),
                    key: key.clone(),
                    values: self.resolve(values).await?,
                };
                accessor.update(&change).await?
            }
            ChangeEntry::Delete { table, key } => {
                let change = DeleteChange {
                    table: table.clone(),
                    key: key.clone(),
                };
                accessor.delete(&change).await?
            }
            ChangeEntry::DeleteAll { table } => {
                accessor.delete_all_rows(table).await?;
            }
        }
        Ok(())
    }

    async fn resolve(&self, fields: &[StoredField]) -> Result<Vec<FieldValue>, StepError> {
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let value = match &field.value {
                StoredValue::Inline { value } => value.clone(),
                StoredValue::Blob { id, len } => {
                    Value::Bytes(read_blob(&self.state.dir, id, *len).await?)
                }
            };
            values.push(FieldValue::new(field.name.clone(), value));
        }
        Ok(values)
    }
}

#[async_trait]
impl Step for RestoreStep {
    fn name(&self) -> &str {
        "restore"
    }

    async fn run(&self) -> Result<(), StepError> {
        let document = self.document().await?;
        let accessor = self.state.target.accessor().clone();
        info!(
            database = %self.state.target.describe(),
            backup_of = %document.source,
            change_sets = document.change_sets.len(),
            changes = document.total_changes(),
            "Starting restore"
        );

        with_lock(accessor.as_ref(), || self.apply(accessor.as_ref(), &document)).await?;

        self.done.store(true, Ordering::Release);
        info!(database = %self.state.target.describe(), "Restore completed");
        Ok(())
    }

    fn progress(&self) -> Progress {
        if self.done.load(Ordering::Acquire) {
            return Progress::new(KEY_RESTORE, 100);
        }
        Progress::new(KEY_RESTORE, u64::from(self.tracker.percent()))
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        changelog::{ColumnDef, TableSchema},
        core::data_type::DataType,
        datasource::DataSourceConfiguration,
    };
    use tempfile::tempdir;

    fn users() -> TableSchema {
        TableSchema::new(
            "users",
            vec![
                ColumnDef::new("id", DataType::Int).not_null(),
                ColumnDef::new("name", DataType::String),
            ],
        )
        .with_primary_key(&["id"])
    }

    fn insert(id: i64) -> ChangeEntry {
        ChangeEntry::Insert {
            table: "users".into(),
            values: vec![
                StoredField::inline("id", Value::Int(id)),
                StoredField::inline("name", Value::String(format!("user{id}"))),
            ],
        }
    }

    fn write_changelog(dir: &Path, change_sets: Vec<ChangeSet>) {
        let document = ChangelogDocument::new("memory://test", change_sets);
        std::fs::write(
            dir.join(CHANGELOG_FILE),
            serde_json::to_vec(&document).unwrap(),
        )
        .unwrap();
    }

    fn weighted(mut cs: ChangeSet, weight: u32) -> ChangeSet {
        cs.weight = weight;
        cs
    }

    fn target() -> DatabaseHandle {
        DatabaseHandle::connect(DataSourceConfiguration::memory("target")).unwrap()
    }

    #[tokio::test]
    async fn applies_changesets_and_reaches_100() {
        let dir = tempdir().unwrap();
        write_changelog(
            dir.path(),
            vec![
                weighted(
                    ChangeSet::new("schema", "t", vec![ChangeEntry::CreateTable { schema: users() }]),
                    10,
                ),
                weighted(ChangeSet::new("data:users", "t", vec![insert(1), insert(2)]), 90),
            ],
        );

        let target = target();
        let step = RestoreStep::new(
            RestoreState {
                target: target.clone(),
                dir: dir.path().to_path_buf(),
            },
            CancelState::new(),
        );
        step.run().await.unwrap();

        assert_eq!(step.progress().percent, 100);
        assert_eq!(target.accessor().count_rows("users").await.unwrap(), 2);
        // The schema lock was released.
        target.accessor().lock().await.unwrap();
    }

    #[tokio::test]
    async fn failed_changeset_is_rolled_back() {
        let dir = tempdir().unwrap();
        write_changelog(
            dir.path(),
            vec![
                weighted(
                    ChangeSet::new("schema", "t", vec![ChangeEntry::CreateTable { schema: users() }]),
                    50,
                ),
                // The duplicate key fails the second change.
                weighted(ChangeSet::new("data:users", "t", vec![insert(1), insert(1)]), 50),
            ],
        );

        let target = target();
        let step = RestoreStep::new(
            RestoreState {
                target: target.clone(),
                dir: dir.path().to_path_buf(),
            },
            CancelState::new(),
        );

        let err = step.run().await.unwrap_err();
        assert!(matches!(
            err,
            StepError::DataAccess(connectors::error::DataAccessError::ChangeFailed { .. })
        ));
        assert_eq!(target.accessor().count_rows("users").await.unwrap(), 0);
        assert_eq!(step.progress().percent, 75);
    }

    #[tokio::test]
    async fn missing_changelog_stays_unusable() {
        let dir = tempdir().unwrap();
        let step = RestoreStep::new(
            RestoreState {
                target: target(),
                dir: dir.path().to_path_buf(),
            },
            CancelState::new(),
        );

        assert!(matches!(step.document().await, Err(StepError::Io { .. })));
        write_changelog(dir.path(), Vec::new());
        assert!(matches!(step.document().await, Err(StepError::Unusable(_))));
    }

    #[tokio::test]
    async fn corrupt_blob_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(BLOB_DIR)).unwrap();
        let id = blake3::hash(b"original").to_hex().to_string();
        std::fs::write(dir.path().join(BLOB_DIR).join(&id), b"tampered").unwrap();

        assert!(matches!(
            read_blob(dir.path(), &id, 8).await,
            Err(StepError::Blob { .. })
        ));
        assert!(matches!(
            read_blob(dir.path(), "../escape", 1).await,
            Err(StepError::Blob { .. })
        ));
    }
}
