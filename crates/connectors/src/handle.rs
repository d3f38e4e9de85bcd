use crate::{
    accessor::ChangelogAccessor, error::DataAccessError, memory::MemoryAccessor,
    sled_store::SledAccessor,
};
use model::datasource::{DataSourceConfiguration, Driver};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{info, warn};
use uuid::Uuid;

struct HandleInner {
    id: String,
    config: DataSourceConfiguration,
    accessor: Arc<dyn ChangelogAccessor>,
    closed: AtomicBool,
}

/// A configured database: its configuration plus the accessor opened from it.
///
/// Handles are cheap to clone and long-lived; every clone refers to the same
/// underlying connection, so closing one closes all of them.
#[derive(Clone)]
pub struct DatabaseHandle {
    inner: Arc<HandleInner>,
}

impl DatabaseHandle {
    pub fn new(config: DataSourceConfiguration, accessor: Arc<dyn ChangelogAccessor>) -> Self {
        DatabaseHandle {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4().to_string(),
                config,
                accessor,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Opens the database described by `config`.
    pub fn connect(config: DataSourceConfiguration) -> Result<Self, DataAccessError> {
        let accessor: Arc<dyn ChangelogAccessor> = match config.driver {
            Driver::Memory => Arc::new(MemoryAccessor::new(config.url.clone())),
            Driver::Sled => {
                if config.url.is_empty() {
                    return Err(DataAccessError::UnsupportedDataSource(
                        "sled data source requires a path".into(),
                    ));
                }
                Arc::new(SledAccessor::open(&config.url)?)
            }
        };
        info!(database = %config.describe(), "Connected database handle");
        Ok(Self::new(config, accessor))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &DataSourceConfiguration {
        &self.inner.config
    }

    pub fn accessor(&self) -> &Arc<dyn ChangelogAccessor> {
        &self.inner.accessor
    }

    pub fn describe(&self) -> String {
        self.inner.config.describe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes the underlying accessor. Only the first call reaches the
    /// accessor; later calls return `Ok(false)`.
    pub async fn close(&self) -> Result<bool, DataAccessError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            warn!(database = %self.describe(), "Database handle already closed");
            return Ok(false);
        }
        self.inner.accessor.close().await?;
        info!(database = %self.describe(), "Closed database handle");
        Ok(true)
    }

    pub fn same_as(&self, other: &DatabaseHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("id", &self.inner.id)
            .field("database", &self.describe())
            .field("closed", &self.is_closed())
            .finish()
    }
}
