use crate::{
    database::{DatabaseManager, DefaultDatabaseManager},
    error::LatchError,
    latch::Lease,
};
use async_trait::async_trait;
use connectors::{
    accessor::{ChangelogAccessor, CustomChange, RowConsumer},
    error::DataAccessError,
};
use model::{
    cancel::CancelState,
    changelog::{DeleteChange, InsertChange, TableSchema, UpdateChange},
};
use std::{
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A changeset the application opened through a [`LatchedAccessor`].
///
/// It keeps the lease taken by `begin_change_set`, so the database cannot
/// be drained until the changeset is committed or rolled back, and it pins
/// the accessor the changeset was opened on.
struct OpenChangeSet {
    accessor: Arc<dyn ChangelogAccessor>,
    interrupt: CancellationToken,
    /// Set once the changeset was committed or rolled back by anyone.
    settled: Arc<AtomicBool>,
    _lease: Lease,
}

/// Accessor used by the application while a migration may be running.
///
/// Every call first takes a lease on the manager, so it waits while the
/// manager is latched and counts as in flight for draining. The call is then
/// delegated to whatever handle is current at that moment.
///
/// Between `begin_change_set` and `end_change_set` (or
/// `rollback_change_set`) a single lease covers the whole changeset and
/// every call goes to the database the changeset was opened on. If a
/// force-drain interrupts the changeset it is rolled back and the remaining
/// calls of that changeset fail with [`DataAccessError::Interrupted`].
/// Clones share the same session.
#[derive(Clone)]
pub struct LatchedAccessor {
    manager: Arc<DefaultDatabaseManager>,
    cancel: CancelState,
    change_set: Arc<Mutex<Option<OpenChangeSet>>>,
}

impl LatchedAccessor {
    pub fn new(manager: Arc<DefaultDatabaseManager>, cancel: CancelState) -> Self {
        LatchedAccessor {
            manager,
            cancel,
            change_set: Arc::new(Mutex::new(None)),
        }
    }

    fn open_change_set(&self) -> MutexGuard<'_, Option<OpenChangeSet>> {
        self.change_set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pinned(&self) -> Option<(Arc<dyn ChangelogAccessor>, CancellationToken)> {
        self.open_change_set()
            .as_ref()
            .map(|open| (open.accessor.clone(), open.interrupt.clone()))
    }

    fn interrupted(&self) -> DataAccessError {
        DataAccessError::Interrupted(self.manager.controller().name().to_string())
    }

    async fn lease(&self) -> Result<Lease, DataAccessError> {
        self.manager.lease(&self.cancel).await.map_err(|err| match err {
            LatchError::Canceled(canceled) => DataAccessError::Canceled(canceled),
            other => DataAccessError::Locked(other.to_string()),
        })
    }

    async fn dispatch<T, F, Fut>(&self, call: F) -> Result<T, DataAccessError>
    where
        F: FnOnce(Arc<dyn ChangelogAccessor>) -> Fut + Send,
        Fut: Future<Output = Result<T, DataAccessError>> + Send,
        T: Send,
    {
        if let Some((accessor, interrupt)) = self.pinned() {
            if interrupt.is_cancelled() {
                self.abandon_change_set().await;
                return Err(self.interrupted());
            }
            return tokio::select! {
                result = call(accessor) => result,
                _ = interrupt.cancelled() => {
                    warn!("Changeset interrupted by force drain");
                    self.abandon_change_set().await;
                    Err(self.interrupted())
                }
            };
        }

        let lease = self.lease().await?;
        let accessor = self.manager.handle().accessor().clone();

        tokio::select! {
            result = call(accessor) => result,
            _ = lease.interrupted().cancelled() => {
                warn!(lease_id = lease.id(), "Database call interrupted by force drain");
                Err(self.interrupted())
            }
        }
    }

    /// Rolls back the open changeset unless it was already settled, then
    /// releases its lease.
    async fn abandon_change_set(&self) {
        let Some(open) = self.open_change_set().take() else {
            return;
        };
        if !open.settled.swap(true, Ordering::AcqRel)
            && let Err(err) = open.accessor.rollback_change_set().await
        {
            warn!(error = %err, "Failed to roll back interrupted changeset");
        }
    }

    /// Commits or rolls back the pinned changeset and releases its lease.
    async fn settle_change_set(&self, commit: bool) -> Result<(), DataAccessError> {
        let Some((accessor, interrupt)) = self.pinned() else {
            // Nothing was opened here; let the database report the misuse.
            return self
                .dispatch(|a| async move {
                    if commit {
                        a.end_change_set().await
                    } else {
                        a.rollback_change_set().await
                    }
                })
                .await;
        };

        if interrupt.is_cancelled() {
            self.abandon_change_set().await;
            return if commit {
                Err(self.interrupted())
            } else {
                Ok(())
            };
        }

        let result = if commit {
            accessor.end_change_set().await
        } else {
            accessor.rollback_change_set().await
        };
        if result.is_ok() {
            let open = self.open_change_set().take();
            if let Some(open) = open {
                open.settled.store(true, Ordering::Release);
            }
        }
        result
    }
}

#[async_trait]
impl ChangelogAccessor for LatchedAccessor {
    async fn count_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.dispatch(|a| async move { a.count_rows(table).await })
            .await
    }

    async fn table_names(&self) -> Result<Vec<String>, DataAccessError> {
        self.dispatch(|a| async move { a.table_names().await }).await
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, DataAccessError> {
        self.dispatch(|a| async move { a.column_names(table).await })
            .await
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema, DataAccessError> {
        self.dispatch(|a| async move { a.table_schema(table).await })
            .await
    }

    async fn for_each_row(
        &self,
        table: &str,
        sort_column: Option<&str>,
        cancel: &CancelState,
        consumer: &mut RowConsumer<'_>,
    ) -> Result<u64, DataAccessError> {
        self.dispatch(|a| async move { a.for_each_row(table, sort_column, cancel, consumer).await })
            .await
    }

    async fn insert(&self, change: &InsertChange) -> Result<(), DataAccessError> {
        self.dispatch(|a| async move { a.insert(change).await })
            .await
    }

    async fn update(&self, change: &UpdateChange) -> Result<(), DataAccessError> {
        self.dispatch(|a| async move { a.update(change).await })
            .await
    }

    async fn delete(&self, change: &DeleteChange) -> Result<(), DataAccessError> {
        self.dispatch(|a| async move { a.delete(change).await })
            .await
    }

    async fn delete_all_rows(&self, table: &str) -> Result<u64, DataAccessError> {
        self.dispatch(|a| async move { a.delete_all_rows(table).await })
            .await
    }

    async fn begin_change_set(&self) -> Result<(), DataAccessError> {
        if self.pinned().is_some() {
            return Err(DataAccessError::ChangeSetState(
                "a changeset is already open".into(),
            ));
        }

        let lease = self.lease().await?;
        let accessor = self.manager.handle().accessor().clone();
        tokio::select! {
            result = accessor.begin_change_set() => result?,
            _ = lease.interrupted().cancelled() => return Err(self.interrupted()),
        }

        let settled = Arc::new(AtomicBool::new(false));
        {
            let accessor = accessor.clone();
            let settled = settled.clone();
            lease.on_force_release(move || async move {
                if settled.swap(true, Ordering::AcqRel) {
                    return;
                }
                match accessor.rollback_change_set().await {
                    Ok(()) => debug!("Rolled back changeset of evicted holder"),
                    Err(err) => warn!(error = %err, "Failed to roll back changeset of evicted holder"),
                }
            });
        }

        *self.open_change_set() = Some(OpenChangeSet {
            accessor,
            interrupt: lease.interrupted().clone(),
            settled,
            _lease: lease,
        });
        Ok(())
    }

    async fn end_change_set(&self) -> Result<(), DataAccessError> {
        self.settle_change_set(true).await
    }

    async fn rollback_change_set(&self) -> Result<(), DataAccessError> {
        self.settle_change_set(false).await
    }

    async fn lock(&self) -> Result<(), DataAccessError> {
        self.dispatch(|a| async move { a.lock().await }).await
    }

    async fn unlock(&self) -> Result<(), DataAccessError> {
        self.dispatch(|a| async move { a.unlock().await }).await
    }

    async fn create_schema(&self, tables: &[TableSchema]) -> Result<(), DataAccessError> {
        self.dispatch(|a| async move { a.create_schema(tables).await })
            .await
    }

    fn find_custom_changes(&self) -> Vec<Arc<dyn CustomChange>> {
        self.manager.handle().accessor().find_custom_changes()
    }

    async fn close(&self) -> Result<(), DataAccessError> {
        self.manager.handle().close().await.map(|_| ())
    }
}
