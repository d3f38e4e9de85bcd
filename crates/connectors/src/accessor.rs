use crate::error::DataAccessError;
use async_trait::async_trait;
use model::{
    cancel::CancelState,
    changelog::{DeleteChange, InsertChange, TableSchema, UpdateChange},
    records::row::RowData,
};
use std::{future::Future, sync::Arc};
use tracing::warn;

/// Callback receiving each row of a table walk.
pub type RowConsumer<'a> = dyn FnMut(RowData) -> Result<(), DataAccessError> + Send + 'a;

/// Connection-level view of a database used by both backup and restore.
///
/// Row-mutating operations fail with [`DataAccessError::TableNotFound`] when
/// the table is missing and with [`DataAccessError::ChangeFailed`] when the
/// row itself could not be applied.
#[async_trait]
pub trait ChangelogAccessor: Send + Sync {
    async fn count_rows(&self, table: &str) -> Result<u64, DataAccessError>;

    async fn table_names(&self) -> Result<Vec<String>, DataAccessError>;

    async fn column_names(&self, table: &str) -> Result<Vec<String>, DataAccessError>;

    async fn table_schema(&self, table: &str) -> Result<TableSchema, DataAccessError>;

    /// Walks every row of `table`, ordered by `sort_column` when given.
    /// The cancel state is checked before each row. Returns the number of
    /// rows handed to `consumer`.
    async fn for_each_row(
        &self,
        table: &str,
        sort_column: Option<&str>,
        cancel: &CancelState,
        consumer: &mut RowConsumer<'_>,
    ) -> Result<u64, DataAccessError>;

    async fn insert(&self, change: &InsertChange) -> Result<(), DataAccessError>;

    async fn update(&self, change: &UpdateChange) -> Result<(), DataAccessError>;

    async fn delete(&self, change: &DeleteChange) -> Result<(), DataAccessError>;

    /// Removes every row of `table`, returning how many were removed.
    async fn delete_all_rows(&self, table: &str) -> Result<u64, DataAccessError>;

    async fn begin_change_set(&self) -> Result<(), DataAccessError>;

    async fn end_change_set(&self) -> Result<(), DataAccessError>;

    /// Discards every mutation since the matching `begin_change_set`.
    async fn rollback_change_set(&self) -> Result<(), DataAccessError>;

    /// Takes the exclusive schema lock. Prefer [`with_lock`].
    async fn lock(&self) -> Result<(), DataAccessError>;

    async fn unlock(&self) -> Result<(), DataAccessError>;

    async fn create_schema(&self, tables: &[TableSchema]) -> Result<(), DataAccessError>;

    /// Changes that run after every changeset of a restore was applied.
    fn find_custom_changes(&self) -> Vec<Arc<dyn CustomChange>>;

    async fn close(&self) -> Result<(), DataAccessError>;
}

/// A programmatic change executed at the end of a restore, e.g. to rebuild
/// derived data the changelog does not carry.
#[async_trait]
pub trait CustomChange: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, accessor: &dyn ChangelogAccessor) -> Result<(), DataAccessError>;
}

/// Runs `effect` while holding the accessor's schema lock.
/// The lock is released whether or not `effect` succeeds.
pub async fn with_lock<A, F, Fut, T, E>(accessor: &A, effect: F) -> Result<T, E>
where
    A: ChangelogAccessor + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DataAccessError>,
{
    accessor.lock().await?;
    let result = effect().await;

    if let Err(err) = accessor.unlock().await {
        if result.is_ok() {
            return Err(err.into());
        }
        warn!(error = %err, "Failed to release schema lock after failed operation");
    }

    result
}
