use crate::{
    error::StepError,
    execution::{KEY_BACKUP, step::Step},
};
use async_trait::async_trait;
use connectors::handle::DatabaseHandle;
use engine_config::settings::BackupSettings;
use engine_core::progress::{BackupMonitor, BackupProgress, Progress};
use model::{
    cancel::{self, CancelState},
    changelog::{
        BLOB_DIR, CHANGELOG_FILE, ChangeEntry, ChangeSet, ChangelogDocument, StoredField,
        StoredValue, TOTAL_WEIGHT, weights::apportion,
    },
    core::value::{FieldValue, Value},
    records::row::RowData,
};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, info};

/// Where a backup is read from and where it is written.
#[derive(Debug, Clone)]
pub struct BackupState {
    pub source: DatabaseHandle,
    pub dir: PathBuf,
    pub settings: BackupSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub dir: PathBuf,
    pub tables: usize,
    pub rows: u64,
    pub blobs: usize,
    pub change_sets: usize,
}

/// Exports the source database into a changelog directory.
///
/// The first changeset recreates the schema, then every table gets one
/// changeset with an insert per row, walked in primary-key order. Weights
/// are apportioned by change count and always sum to 100.
pub struct BackupStep {
    state: BackupState,
    cancel: CancelState,
    monitor: Arc<BackupProgress>,
    done: AtomicBool,
    summary: Mutex<Option<BackupSummary>>,
}

impl BackupStep {
    pub fn new(state: BackupState, cancel: CancelState) -> Self {
        BackupStep {
            state,
            cancel,
            monitor: Arc::new(BackupProgress::new()),
            done: AtomicBool::new(false),
            summary: Mutex::new(None),
        }
    }

    pub fn summary(&self) -> Option<BackupSummary> {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn export(&self) -> Result<BackupSummary, StepError> {
        let dir = &self.state.dir;
        let changelog_path = dir.join(CHANGELOG_FILE);
        if tokio::fs::try_exists(&changelog_path)
            .await
            .map_err(|e| StepError::io(&changelog_path, e))?
        {
            return Err(StepError::io(
                &changelog_path,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "backup already exists"),
            ));
        }

        let accessor = self.state.source.accessor().clone();
        let settings = &self.state.settings;

        let mut tables = Vec::new();
        for name in accessor.table_names().await? {
            if settings.is_excluded(&name) {
                info!(table = %name, "Table excluded from backup");
                continue;
            }
            tables.push(accessor.table_schema(&name).await?);
        }

        let mut total_rows = 0;
        for schema in &tables {
            total_rows += accessor.count_rows(&schema.name).await?;
        }
        self.monitor.started(total_rows);
        info!(
            source = %self.state.source.describe(),
            tables = tables.len(),
            total_rows,
            dir = %dir.display(),
            "Starting backup"
        );

        let blob_dir = dir.join(BLOB_DIR);
        tokio::fs::create_dir_all(&blob_dir)
            .await
            .map_err(|e| StepError::io(&blob_dir, e))?;

        let schema_changes = tables
            .iter()
            .cloned()
            .map(|schema| ChangeEntry::CreateTable { schema })
            .collect();
        let mut change_sets = vec![ChangeSet::new("schema", &settings.author, schema_changes)];
        let mut blob_ids = HashSet::new();

        for schema in &tables {
            cancel::check(&self.cancel)?;

            let table = schema.name.clone();
            let threshold = settings.blob_threshold_bytes;
            let monitor = self.monitor.clone();
            let mut changes = Vec::new();
            let mut pending_blobs = Vec::new();

            let rows = accessor
                .for_each_row(
                    &schema.name,
                    schema.sort_column(),
                    &self.cancel,
                    &mut |row: RowData| {
                        let values = row
                            .field_values
                            .into_iter()
                            .map(|field| store_field(field, threshold, &mut pending_blobs))
                            .collect();
                        changes.push(ChangeEntry::Insert {
                            table: table.clone(),
                            values,
                        });
                        monitor.row_written();
                        Ok(())
                    },
                )
                .await?;

            for (id, bytes) in pending_blobs {
                if blob_ids.insert(id.clone()) {
                    write_blob(&blob_dir, &id, &bytes).await?;
                }
            }

            debug!(table = %schema.name, rows, "Exported table");
            change_sets.push(ChangeSet::new(
                format!("data:{}", schema.name),
                &settings.author,
                changes,
            ));
        }

        let costs: Vec<u64> = change_sets.iter().map(|cs| cs.change_count).collect();
        for (cs, weight) in change_sets.iter_mut().zip(apportion(&costs, TOTAL_WEIGHT)) {
            cs.weight = weight;
        }

        let document = ChangelogDocument::new(self.state.source.describe(), change_sets);
        let json = serde_json::to_vec_pretty(&document)?;
        tokio::fs::write(&changelog_path, json)
            .await
            .map_err(|e| StepError::io(&changelog_path, e))?;

        Ok(BackupSummary {
            dir: dir.clone(),
            tables: tables.len(),
            rows: self.monitor.rows_written(),
            blobs: blob_ids.len(),
            change_sets: document.change_sets.len(),
        })
    }
}

fn store_field(
    field: FieldValue,
    threshold: usize,
    pending: &mut Vec<(String, Vec<u8>)>,
) -> StoredField {
    match field.value {
        Value::Bytes(bytes) if bytes.len() > threshold => {
            let id = blake3::hash(&bytes).to_hex().to_string();
            let len = bytes.len() as u64;
            pending.push((id.clone(), bytes));
            StoredField {
                name: field.name,
                value: StoredValue::Blob { id, len },
            }
        }
        value => StoredField::inline(field.name, value),
    }
}

async fn write_blob(blob_dir: &Path, id: &str, bytes: &[u8]) -> Result<(), StepError> {
    let path = blob_dir.join(id);
    // Content addressed: an existing file already holds these bytes.
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(());
    }
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| StepError::io(&path, e))
}

#[async_trait]
impl Step for BackupStep {
    fn name(&self) -> &str {
        "backup"
    }

    async fn run(&self) -> Result<(), StepError> {
        let summary = self.export().await?;
        info!(
            tables = summary.tables,
            rows = summary.rows,
            blobs = summary.blobs,
            dir = %summary.dir.display(),
            "Backup completed"
        );
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner) = Some(summary);
        self.done.store(true, Ordering::Release);
        Ok(())
    }

    fn progress(&self) -> Progress {
        if self.done.load(Ordering::Acquire) {
            return Progress::new(KEY_BACKUP, 100);
        }
        // The changelog is only complete once it has been written.
        Progress::new(KEY_BACKUP, u64::from(self.monitor.percent().min(99)))
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}
