use crate::{
    accessor::{ChangelogAccessor, CustomChange, RowConsumer},
    error::DataAccessError,
    schema,
};
use async_trait::async_trait;
use model::{
    cancel::{self, CancelState},
    changelog::{DeleteChange, InsertChange, TableSchema, UpdateChange},
    core::value::FieldValue,
    records::row::RowData,
};
use sled::IVec;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA_TREE: &str = "__schema";
const TABLE_PREFIX: &str = "table:";

/// Undo record for one mutation made while a changeset is open.
enum Undo {
    Restore {
        tree: String,
        key: IVec,
        previous: Option<IVec>,
    },
    DropTable {
        tree: String,
    },
}

/// Embedded database on top of sled: one tree per table, schemas in a
/// dedicated tree, rows JSON-encoded. Keyed tables use their primary key as
/// the sled key, others a generated sequence.
pub struct SledAccessor {
    path: PathBuf,
    db: sled::Db,
    schema: sled::Tree,
    /// `Some` while a changeset is open. Every mutation holds this lock.
    undo: Mutex<Option<Vec<Undo>>>,
    custom_changes: Vec<Arc<dyn CustomChange>>,
    locked: AtomicBool,
    closed: AtomicBool,
}

impl SledAccessor {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DataAccessError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        let schema = db.open_tree(SCHEMA_TREE)?;
        info!(path = %path.display(), "Opened sled database");

        Ok(Self {
            path,
            db,
            schema,
            undo: Mutex::new(None),
            custom_changes: Vec::new(),
            locked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn with_custom_change(mut self, change: Arc<dyn CustomChange>) -> Self {
        self.custom_changes.push(change);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn tree_name(table: &str) -> String {
        format!("{TABLE_PREFIX}{table}")
    }

    fn ensure_open(&self) -> Result<(), DataAccessError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DataAccessError::Closed(self.path.display().to_string()))
        } else {
            Ok(())
        }
    }

    fn load_schema(&self, table: &str) -> Result<TableSchema, DataAccessError> {
        match self.schema.get(table)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(DataAccessError::TableNotFound(table.to_string())),
        }
    }

    fn table(&self, table: &str) -> Result<(TableSchema, sled::Tree), DataAccessError> {
        let schema = self.load_schema(table)?;
        let tree = self.db.open_tree(Self::tree_name(table))?;
        Ok((schema, tree))
    }

    fn encode_key(key: &[FieldValue]) -> Result<Vec<u8>, DataAccessError> {
        let mut bytes = b"k".to_vec();
        bytes.extend(serde_json::to_vec(key)?);
        Ok(bytes)
    }

    fn row_key(&self, schema: &TableSchema, row: &RowData) -> Result<Vec<u8>, DataAccessError> {
        match schema::primary_key(schema, row) {
            Some(key) => Self::encode_key(&key),
            None => {
                let mut bytes = b"s".to_vec();
                bytes.extend(self.db.generate_id()?.to_be_bytes());
                Ok(bytes)
            }
        }
    }

    fn rows(tree: &sled::Tree) -> Result<Vec<(IVec, RowData)>, DataAccessError> {
        let mut rows = Vec::new();
        for item in tree.iter() {
            let (key, value) = item?;
            rows.push((key, serde_json::from_slice(&value)?));
        }
        Ok(rows)
    }

    /// Rows matching `key`. A key that is exactly the primary key is looked
    /// up directly; anything else scans the table.
    fn matching_rows(
        schema: &TableSchema,
        tree: &sled::Tree,
        key: &[FieldValue],
    ) -> Result<Vec<(IVec, RowData)>, DataAccessError> {
        match schema::exact_primary_key(schema, key) {
            Some(primary_key) => {
                let encoded = Self::encode_key(&primary_key)?;
                match tree.get(&encoded)? {
                    Some(bytes) => Ok(vec![(IVec::from(encoded), serde_json::from_slice(&bytes)?)]),
                    None => Ok(Vec::new()),
                }
            }
            None => Ok(Self::rows(tree)?
                .into_iter()
                .filter(|(_, row)| row.matches(key))
                .collect()),
        }
    }

    fn record(undo: &mut Option<Vec<Undo>>, tree: &str, key: IVec, previous: Option<IVec>) {
        if let Some(log) = undo.as_mut() {
            log.push(Undo::Restore {
                tree: tree.to_string(),
                key,
                previous,
            });
        }
    }
}

#[async_trait]
impl ChangelogAccessor for SledAccessor {
    async fn count_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.ensure_open()?;
        let (_, tree) = self.table(table)?;
        Ok(tree.len() as u64)
    }

    async fn table_names(&self) -> Result<Vec<String>, DataAccessError> {
        self.ensure_open()?;
        let mut names = Vec::new();
        for key in self.schema.iter().keys() {
            names.push(String::from_utf8_lossy(&key?).into_owned());
        }
        Ok(names)
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, DataAccessError> {
        Ok(self.table_schema(table).await?.column_names())
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, DataAccessError> {
        self.ensure_open()?;
        self.load_schema(table)
    }

    async fn for_each_row(
        &self,
        table: &str,
        sort_column: Option<&str>,
        cancel: &CancelState,
        consumer: &mut RowConsumer<'_>,
    ) -> Result<u64, DataAccessError> {
        self.ensure_open()?;
        let (schema, tree) = self.table(table)?;
        if let Some(column) = sort_column {
            schema::ensure_column(&schema, column)?;
        }

        let mut rows: Vec<RowData> = Self::rows(&tree)?.into_iter().map(|(_, r)| r).collect();
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
        let mut undo = self.undo.lock().await;
        let (schema, tree) = self.table(&change.table)?;

        let row = schema::conform_row(&schema, &change.values, change)?;
        let key = self.row_key(&schema, &row)?;
        if tree.contains_key(&key)? {
            return Err(DataAccessError::change_failed(
                change,
                "duplicate primary key",
            ));
        }

        let previous = tree.insert(&key, serde_json::to_vec(&row)?)?;
        Self::record(&mut undo, &Self::tree_name(&change.table), key.into(), previous);
        Ok(())
    }

    async fn update(&self, change: &UpdateChange) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut undo = self.undo.lock().await;
        let (schema, tree) = self.table(&change.table)?;
        schema::ensure_columns(&schema, &change.key)?;
        schema::ensure_columns(&schema, &change.values)?;

        let mut updated = Vec::new();
        for (key, mut row) in Self::matching_rows(&schema, &tree, &change.key)? {
            row.apply(&change.values);
            schema::check_row(&schema, &row, change)?;
            updated.push((key, row));
        }
        if updated.is_empty() {
            return Err(DataAccessError::change_failed(change, "no row matches key"));
        }

        let tree_name = Self::tree_name(&change.table);
        for (key, row) in updated {
            let previous = tree.insert(&key, serde_json::to_vec(&row)?)?;
            Self::record(&mut undo, &tree_name, key, previous);
        }
        Ok(())
    }

    async fn delete(&self, change: &DeleteChange) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut undo = self.undo.lock().await;
        let (schema, tree) = self.table(&change.table)?;
        schema::ensure_columns(&schema, &change.key)?;

        let tree_name = Self::tree_name(&change.table);
        let mut removed = 0;
        for (key, _) in Self::matching_rows(&schema, &tree, &change.key)? {
            let previous = tree.remove(&key)?;
            Self::record(&mut undo, &tree_name, key, previous);
            removed += 1;
        }

        if removed == 0 {
            return Err(DataAccessError::change_failed(change, "no row matches key"));
        }
        Ok(())
    }

    async fn delete_all_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.ensure_open()?;
        let mut undo = self.undo.lock().await;
        let (_, tree) = self.table(table)?;
        let removed = tree.len() as u64;

        if undo.is_some() {
            let tree_name = Self::tree_name(table);
            for item in tree.iter() {
                let (key, value) = item?;
                Self::record(&mut undo, &tree_name, key, Some(value));
            }
        }
        tree.clear()?;
        Ok(removed)
    }

    async fn begin_change_set(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut undo = self.undo.lock().await;
        if undo.is_some() {
            return Err(DataAccessError::ChangeSetState(
                "a changeset is already open".into(),
            ));
        }
        *undo = Some(Vec::new());
        Ok(())
    }

    async fn end_change_set(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut undo = self.undo.lock().await;
        if undo.take().is_none() {
            return Err(DataAccessError::ChangeSetState("no changeset is open".into()));
        }
        self.db.flush_async().await?;
        Ok(())
    }

    async fn rollback_change_set(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut undo = self.undo.lock().await;
        let log = undo
            .take()
            .ok_or_else(|| DataAccessError::ChangeSetState("no changeset is open".into()))?;

        let undone = log.len();
        for entry in log.into_iter().rev() {
            match entry {
                Undo::Restore {
                    tree,
                    key,
                    previous,
                } => {
                    let tree = self.db.open_tree(tree)?;
                    match previous {
                        Some(value) => {
                            tree.insert(key, value)?;
                        }
                        None => {
                            tree.remove(key)?;
                        }
                    }
                }
                Undo::DropTable { tree } => {
                    self.db.drop_tree(tree)?;
                }
            }
        }
        self.db.flush_async().await?;
        debug!(path = %self.path.display(), undone, "Rolled back changeset");
        Ok(())
    }

    async fn lock(&self) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| DataAccessError::Locked(self.path.display().to_string()))
    }

    async fn unlock(&self) -> Result<(), DataAccessError> {
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_schema(&self, tables: &[TableSchema]) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let mut undo = self.undo.lock().await;
        for table in tables {
            if self.schema.contains_key(&table.name)? {
                return Err(DataAccessError::TableExists(table.name.clone()));
            }
        }

        for table in tables {
            let previous = self
                .schema
                .insert(table.name.as_bytes(), serde_json::to_vec(table)?)?;
            self.db.open_tree(Self::tree_name(&table.name))?;
            if let Some(log) = undo.as_mut() {
                log.push(Undo::DropTable {
                    tree: Self::tree_name(&table.name),
                });
            }
            Self::record(&mut undo, SCHEMA_TREE, table.name.as_bytes().into(), previous);
        }
        Ok(())
    }

    fn find_custom_changes(&self) -> Vec<Arc<dyn CustomChange>> {
        self.custom_changes.clone()
    }

    async fn close(&self) -> Result<(), DataAccessError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.flush_async().await?;
        info!(path = %self.path.display(), "Closed sled database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        changelog::ColumnDef,
        core::{data_type::DataType, value::Value},
    };
    use tempfile::tempdir;

    fn blobs() -> TableSchema {
        TableSchema::new(
            "blobs",
            vec![
                ColumnDef::new("id", DataType::Int).not_null(),
                ColumnDef::new("data", DataType::Bytes),
            ],
        )
        .with_primary_key(&["id"])
    }

    fn insert(id: i64) -> InsertChange {
        InsertChange {
            table: "blobs".into(),
            values: vec![
                FieldValue::new("id", Value::Int(id)),
                FieldValue::new("data", Value::Bytes(vec![id as u8; 4])),
            ],
        }
    }

    #[tokio::test]
    async fn persists_rows_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = SledAccessor::open(dir.path()).unwrap();
            db.create_schema(&[blobs()]).await.unwrap();
            db.insert(&insert(2)).await.unwrap();
            db.insert(&insert(1)).await.unwrap();
            db.close().await.unwrap();
        }

        let db = SledAccessor::open(dir.path()).unwrap();
        assert_eq!(db.table_names().await.unwrap(), vec!["blobs".to_string()]);
        assert_eq!(db.count_rows("blobs").await.unwrap(), 2);

        let mut ids = Vec::new();
        db.for_each_row("blobs", Some("id"), &CancelState::new(), &mut |row| {
            ids.push(row.get_value("id"));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(2)]);
    }

    #[tokio::test]
    async fn rollback_undoes_schema_and_rows() {
        let dir = tempdir().unwrap();
        let db = SledAccessor::open(dir.path()).unwrap();

        db.begin_change_set().await.unwrap();
        db.create_schema(&[blobs()]).await.unwrap();
        db.insert(&insert(1)).await.unwrap();
        db.rollback_change_set().await.unwrap();

        assert!(db.table_names().await.unwrap().is_empty());
        assert!(matches!(
            db.count_rows("blobs").await,
            Err(DataAccessError::TableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rollback_restores_cleared_rows() {
        let dir = tempdir().unwrap();
        let db = SledAccessor::open(dir.path()).unwrap();
        db.create_schema(&[blobs()]).await.unwrap();
        db.insert(&insert(1)).await.unwrap();

        db.begin_change_set().await.unwrap();
        assert_eq!(db.delete_all_rows("blobs").await.unwrap(), 1);
        db.rollback_change_set().await.unwrap();

        assert_eq!(db.count_rows("blobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_primary_key() {
        let dir = tempdir().unwrap();
        let db = SledAccessor::open(dir.path()).unwrap();
        db.create_schema(&[blobs()]).await.unwrap();
        db.insert(&insert(1)).await.unwrap();

        let err = db.insert(&insert(1)).await.unwrap_err();
        assert!(matches!(err, DataAccessError::ChangeFailed { .. }));
    }

    #[tokio::test]
    async fn updates_and_deletes_by_primary_key_or_other_columns() {
        let dir = tempdir().unwrap();
        let db = SledAccessor::open(dir.path()).unwrap();
        db.create_schema(&[blobs()]).await.unwrap();
        for id in 1..=3 {
            db.insert(&insert(id)).await.unwrap();
        }

        db.update(&UpdateChange {
            table: "blobs".into(),
            key: vec![FieldValue::new("ID", Value::Int(2))],
            values: vec![FieldValue::new("data", Value::Bytes(vec![9]))],
        })
        .await
        .unwrap();
        db.delete(&DeleteChange {
            table: "blobs".into(),
            key: vec![FieldValue::new("data", Value::Bytes(vec![3; 4]))],
        })
        .await
        .unwrap();
        db.delete(&DeleteChange {
            table: "blobs".into(),
            key: vec![FieldValue::new("id", Value::Int(1))],
        })
        .await
        .unwrap();

        let missing = db
            .delete(&DeleteChange {
                table: "blobs".into(),
                key: vec![FieldValue::new("id", Value::Int(7))],
            })
            .await;
        assert!(matches!(missing, Err(DataAccessError::ChangeFailed { .. })));

        let mut rows = Vec::new();
        db.for_each_row("blobs", Some("id"), &CancelState::new(), &mut |row| {
            rows.push((row.get_value("id"), row.get_value("data")));
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(rows, vec![(Value::Int(2), Value::Bytes(vec![9]))]);
    }
}
