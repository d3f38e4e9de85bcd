use crate::{
    accessor::{ChangelogAccessor, CustomChange, RowConsumer},
    error::DataAccessError,
    schema,
};
use async_trait::async_trait;
use model::{
    cancel::{self, CancelState},
    changelog::{DeleteChange, InsertChange, TableSchema, UpdateChange},
    records::row::RowData,
};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<RowData>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    /// Copy of `tables` taken when a changeset was opened.
    snapshot: Option<BTreeMap<String, MemoryTable>>,
}

/// A process-local database. Changesets are bracketed by snapshotting the
/// whole table map, so a rollback restores it exactly.
pub struct MemoryAccessor {
    name: String,
    state: Mutex<MemoryState>,
    custom_changes: Vec<Arc<dyn CustomChange>>,
    locked: AtomicBool,
    closed: AtomicBool,
}

impl MemoryAccessor {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryAccessor {
            name: name.into(),
            state: Mutex::new(MemoryState::default()),
            custom_changes: Vec::new(),
            locked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_custom_change(mut self, change: Arc<dyn CustomChange>) -> Self {
        self.custom_changes.push(change);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), DataAccessError> {
        if self.is_closed() {
            Err(DataAccessError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

fn table_mut<'a>(
    state: &'a mut MemoryState,
    table: &str,
) -> Result<&'a mut MemoryTable, DataAccessError> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| DataAccessError::TableNotFound(table.to_string()))
}

#[async_trait]
impl ChangelogAccessor for MemoryAccessor {
    async fn count_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        Ok(table_mut(&mut state, table)?.rows.len() as u64)
    }

    async fn table_names(&self) -> Result<Vec<String>, DataAccessError> {
        self.ensure_open()?;
        let state = self.state.lock().await;
        Ok(state.tables.keys().cloned().collect())
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, DataAccessError> {
        Ok(self.table_schema(table).await?.column_names())
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        Ok(table_mut(&mut state, table)?.schema.clone())
    }

    async fn for_each_row(
        &self,
        table: &str,
        sort_column: Option<&str>,
        cancel: &CancelState,
        consumer: &mut RowConsumer<'_>,
    ) -> Result<u64, DataAccessError> {
        self.ensure_open()?;
        let mut rows = {
            let mut state = self.state.lock().await;
            let table = table_mut(&mut state, table)?;
            if let Some(column) = sort_column {
                schema::ensure_column(&table.schema, column)?;
            }
            table.rows.clone()
        };

        if let Some(column) = sort_column {
            schema::sort_rows(&mut rows, column);
        }

        let mut processed = 0;
        for row in rows {
            cancel::check(cancel)?;
            consumer(row)?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn insert(&self, change: &InsertChange) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let table = table_mut(&mut state, &change.table)?;

        let row = schema::conform_row(&table.schema, &change.values, change)?;
        if let Some(key) = schema::primary_key(&table.schema, &row)
            && table.rows.iter().any(|existing| existing.matches(&key))
        {
            return Err(DataAccessError::change_failed(
                change,
                "duplicate primary key",
            ));
        }

        table.rows.push(row);
        Ok(())
    }

    async fn update(&self, change: &UpdateChange) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let table = table_mut(&mut state, &change.table)?;
        schema::ensure_columns(&table.schema, &change.key)?;
        schema::ensure_columns(&table.schema, &change.values)?;

        let mut updated = Vec::new();
        for (idx, row) in table.rows.iter().enumerate() {
            if row.matches(&change.key) {
                let mut candidate = row.clone();
                candidate.apply(&change.values);
                schema::check_row(&table.schema, &candidate, change)?;
                updated.push((idx, candidate));
            }
        }

        if updated.is_empty() {
            return Err(DataAccessError::change_failed(change, "no row matches key"));
        }
        for (idx, row) in updated {
            table.rows[idx] = row;
        }
        Ok(())
    }

    async fn delete(&self, change: &DeleteChange) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let table = table_mut(&mut state, &change.table)?;
        schema::ensure_columns(&table.schema, &change.key)?;

        let before = table.rows.len();
        table.rows.retain(|row| !row.matches(&change.key));
        if table.rows.len() == before {
            return Err(DataAccessError::change_failed(change, "no row matches key"));
        }
        Ok(())
    }

    async fn delete_all_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let table = table_mut(&mut state, table)?;
        let removed = table.rows.len() as u64;
        table.rows.clear();
        Ok(removed)
    }

    async fn begin_change_set(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.snapshot.is_some() {
            return Err(DataAccessError::ChangeSetState(
                "a changeset is already open".into(),
            ));
        }
        state.snapshot = Some(state.tables.clone());
        Ok(())
    }

    async fn end_change_set(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        state
            .snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| DataAccessError::ChangeSetState("no changeset is open".into()))
    }

    async fn rollback_change_set(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        let snapshot = state
            .snapshot
            .take()
            .ok_or_else(|| DataAccessError::ChangeSetState("no changeset is open".into()))?;
        state.tables = snapshot;
        debug!(database = %self.name, "Rolled back changeset");
        Ok(())
    }

    async fn lock(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| DataAccessError::Locked(self.name.clone()))
    }

    async fn unlock(&self) -> Result<(), DataAccessError> {
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_schema(&self, tables: &[TableSchema]) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if let Some(existing) = tables.iter().find(|t| state.tables.contains_key(&t.name)) {
            return Err(DataAccessError::TableExists(existing.name.clone()));
        }
        for table in tables {
            state.tables.insert(
                table.name.clone(),
                MemoryTable {
                    schema: table.clone(),
                    rows: Vec::new(),
                },
            );
        }
        Ok(())
    }

    fn find_custom_changes(&self) -> Vec<Arc<dyn CustomChange>> {
        self.custom_changes.clone()
    }

    async fn close(&self) -> Result<(), DataAccessError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
