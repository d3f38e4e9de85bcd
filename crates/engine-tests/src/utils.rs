#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use connectors::{
    accessor::{ChangelogAccessor, CustomChange, RowConsumer},
    error::DataAccessError,
    handle::DatabaseHandle,
};
use model::{
    cancel::{self, CancelState},
    changelog::{ColumnDef, DeleteChange, InsertChange, TableSchema, UpdateChange},
    core::{
        data_type::DataType,
        value::{FieldValue, Value},
    },
    records::row::RowData,
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::Notify;

pub const USERS: &str = "users";
pub const DOCUMENTS: &str = "documents";
pub const AUDIT_LOG: &str = "audit_log";

pub fn users_schema() -> TableSchema {
    TableSchema::new(
        USERS,
        vec![
            ColumnDef::new("id", DataType::Int).not_null(),
            ColumnDef::new("email", DataType::String).not_null(),
            ColumnDef::new("active", DataType::Boolean),
            ColumnDef::new("created_at", DataType::Timestamp),
        ],
    )
    .with_primary_key(&["id"])
}

pub fn documents_schema() -> TableSchema {
    TableSchema::new(
        DOCUMENTS,
        vec![
            ColumnDef::new("id", DataType::Int).not_null(),
            ColumnDef::new("owner_id", DataType::Int),
            ColumnDef::new("body", DataType::Bytes),
            ColumnDef::new("meta", DataType::Json),
        ],
    )
    .with_primary_key(&["id"])
}

pub fn audit_schema() -> TableSchema {
    TableSchema::new(
        AUDIT_LOG,
        vec![
            ColumnDef::new("seq", DataType::Int).not_null(),
            ColumnDef::new("message", DataType::String),
        ],
    )
    .with_primary_key(&["seq"])
}

pub fn user_row(id: i64) -> Vec<FieldValue> {
    vec![
        FieldValue::new("id", Value::Int(id)),
        FieldValue::new("email", Value::String(format!("user{id}@example.com"))),
        FieldValue::new("active", Value::Boolean(id % 2 == 0)),
        FieldValue::new(
            "created_at",
            Value::Timestamp(Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap()),
        ),
    ]
}

/// Documents alternate between small inline bodies and bodies large enough
/// to be stored as blobs with the default threshold.
pub fn document_row(id: i64) -> Vec<FieldValue> {
    let size = if id % 2 == 0 { 128 * 1024 } else { 16 };
    vec![
        FieldValue::new("id", Value::Int(id)),
        FieldValue::new("owner_id", Value::Int(id % 5)),
        FieldValue::new("body", Value::Bytes(vec![(id % 251) as u8; size])),
        FieldValue::new("meta", Value::Json(serde_json::json!({ "rev": id }))),
    ]
}

/// Creates the test schema and fills it with `users` users and `documents`
/// documents.
pub async fn populate_data(handle: &DatabaseHandle, users: i64, documents: i64) {
    let accessor = handle.accessor();
    accessor
        .create_schema(&[users_schema(), documents_schema(), audit_schema()])
        .await
        .expect("create schema");

    for id in 1..=users {
        insert(accessor.as_ref(), USERS, user_row(id)).await;
    }
    for id in 1..=documents {
        insert(accessor.as_ref(), DOCUMENTS, document_row(id)).await;
    }
    insert(
        accessor.as_ref(),
        AUDIT_LOG,
        vec![
            FieldValue::new("seq", Value::Int(1)),
            FieldValue::new("message", Value::String("created".into())),
        ],
    )
    .await;
}

pub async fn insert(accessor: &dyn ChangelogAccessor, table: &str, values: Vec<FieldValue>) {
    accessor
        .insert(&InsertChange {
            table: table.to_string(),
            values,
        })
        .await
        .expect("insert row");
}

/// Every row of `table` in primary-key order.
pub async fn fetch_rows(handle: &DatabaseHandle, table: &str) -> Vec<RowData> {
    let accessor = handle.accessor();
    let schema = accessor.table_schema(table).await.expect("table schema");
    let mut rows = Vec::new();
    accessor
        .for_each_row(
            table,
            schema.sort_column(),
            &CancelState::new(),
            &mut |row: RowData| {
                rows.push(row);
                Ok(())
            },
        )
        .await
        .expect("walk rows");
    rows
}

pub async fn get_row_count(handle: &DatabaseHandle, table: &str) -> u64 {
    handle
        .accessor()
        .count_rows(table)
        .await
        .expect("count rows")
}

pub async fn assert_row_count(handle: &DatabaseHandle, table: &str, expected: u64) {
    let actual = get_row_count(handle, table).await;
    assert_eq!(
        actual, expected,
        "Expected {expected} rows in {table}, found {actual}"
    );
}

pub async fn get_table_names(handle: &DatabaseHandle) -> Vec<String> {
    let mut names = handle
        .accessor()
        .table_names()
        .await
        .expect("table names");
    names.sort();
    names
}

/// Asserts both databases hold the same tables with identical rows.
pub async fn assert_same_contents(expected: &DatabaseHandle, actual: &DatabaseHandle) {
    let tables = get_table_names(expected).await;
    assert_eq!(tables, get_table_names(actual).await, "table sets differ");

    for table in &tables {
        let left = fetch_rows(expected, table).await;
        let right = fetch_rows(actual, table).await;
        assert_eq!(left.len(), right.len(), "row count differs for {table}");
        for (l, r) in left.iter().zip(&right) {
            for field in &l.field_values {
                assert_eq!(
                    r.get_value(&field.name),
                    field.value,
                    "column {}.{} differs",
                    table,
                    field.name
                );
            }
        }
    }
}

/// Custom change that parks until released, so a test can act while a
/// restore is in its final stage.
pub struct GateChange {
    pub entered: Notify,
    pub release: Notify,
    pub runs: AtomicUsize,
}

impl GateChange {
    pub fn new() -> Arc<Self> {
        Arc::new(GateChange {
            entered: Notify::new(),
            release: Notify::new(),
            runs: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CustomChange for GateChange {
    fn id(&self) -> &str {
        "gate"
    }

    async fn execute(&self, _accessor: &dyn ChangelogAccessor) -> Result<(), DataAccessError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Accessor that parks right after handing out the first row of `table`
/// until released, so a test can act while a backup is mid-walk.
pub struct GatedWalk {
    inner: Arc<dyn ChangelogAccessor>,
    table: String,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedWalk {
    pub fn new(inner: Arc<dyn ChangelogAccessor>, table: &str) -> Arc<Self> {
        Arc::new(GatedWalk {
            inner,
            table: table.to_string(),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl ChangelogAccessor for GatedWalk {
    async fn count_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.inner.count_rows(table).await
    }

    async fn table_names(&self) -> Result<Vec<String>, DataAccessError> {
        self.inner.table_names().await
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, DataAccessError> {
        self.inner.column_names(table).await
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, DataAccessError> {
        self.inner.table_schema(table).await
    }

    async fn for_each_row(
        &self,
        table: &str,
        sort_column: Option<&str>,
        cancel: &CancelState,
        consumer: &mut RowConsumer<'_>,
    ) -> Result<u64, DataAccessError> {
        if table != self.table {
            return self.inner.for_each_row(table, sort_column, cancel, consumer).await;
        }

        let mut rows = Vec::new();
        self.inner
            .for_each_row(table, sort_column, cancel, &mut |row: RowData| {
                rows.push(row);
                Ok(())
            })
            .await?;

        let mut processed = 0;
        for row in rows {
            cancel::check(cancel)?;
            consumer(row)?;
            processed += 1;
            if processed == 1 {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
        Ok(processed)
    }

    async fn insert(&self, change: &InsertChange) -> Result<(), DataAccessError> {
        self.inner.insert(change).await
    }

    async fn update(&self, change: &UpdateChange) -> Result<(), DataAccessError> {
        self.inner.update(change).await
    }

    async fn delete(&self, change: &DeleteChange) -> Result<(), DataAccessError> {
        self.inner.delete(change).await
    }

    async fn delete_all_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.inner.delete_all_rows(table).await
    }

    async fn begin_change_set(&self) -> Result<(), DataAccessError> {
        self.inner.begin_change_set().await
    }

    async fn end_change_set(&self) -> Result<(), DataAccessError> {
        self.inner.end_change_set().await
    }

    async fn rollback_change_set(&self) -> Result<(), DataAccessError> {
        self.inner.rollback_change_set().await
    }

    async fn lock(&self) -> Result<(), DataAccessError> {
        self.inner.lock().await
    }

    async fn unlock(&self) -> Result<(), DataAccessError> {
        self.inner.unlock().await
    }

    async fn create_schema(&self, tables: &[TableSchema]) -> Result<(), DataAccessError> {
        self.inner.create_schema(tables).await
    }

    fn find_custom_changes(&self) -> Vec<Arc<dyn CustomChange>> {
        self.inner.find_custom_changes()
    }

    async fn close(&self) -> Result<(), DataAccessError> {
        self.inner.close().await
    }
}
