use crate::{
    error::ConfigStoreError,
    state::{ConfigurationService, models::ConfigurationRecord},
};
use async_trait::async_trait;
use model::datasource::DataSourceConfiguration;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;
use tracing::info;

const ACTIVE_KEY: &str = "cfg:active";

/// Configuration store in a sled database. Every save is also appended to a
/// history keyed by revision.
pub struct SledConfigurationStore {
    db: sled::Db,
}

impl SledConfigurationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigStoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    #[inline]
    fn history_key(revision: u64) -> String {
        format!("cfg:history:{:020}", revision)
    }

    pub fn history(&self) -> Result<Vec<ConfigurationRecord>, ConfigStoreError> {
        let mut records = Vec::new();
        for item in self.db.scan_prefix("cfg:history:") {
            let (_key, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl ConfigurationService for SledConfigurationStore {
    async fn save_data_source_configuration(
        &self,
        config: &DataSourceConfiguration,
        previous: Option<&DataSourceConfiguration>,
    ) -> Result<(), ConfigStoreError> {
        // Revision bump and both writes happen atomically.
        let result = self.db.transaction::<_, _, ConfigStoreError>(|tx_db| {
            let revision = match tx_db.get(ACTIVE_KEY)? {
                Some(bytes) => {
                    let active: ConfigurationRecord = bincode::deserialize(&bytes)
                        .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;
                    active.revision + 1
                }
                None => 1,
            };

            let record = ConfigurationRecord {
                revision,
                config: config.clone(),
                previous: previous.cloned(),
                saved_at: chrono::Utc::now(),
            };
            let bytes = bincode::serialize(&record)
                .map_err(|e| ConflictableTransactionError::Abort(e.into()))?;

            tx_db.insert(ACTIVE_KEY, bytes.as_slice())?;
            tx_db.insert(Self::history_key(revision).as_bytes(), bytes.as_slice())?;
            Ok(revision)
        });

        let revision = match result {
            Ok(revision) => revision,
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        };
        self.db.flush_async().await?;

        info!(
            revision,
            database = %config.describe(),
            "Saved data source configuration"
        );
        Ok(())
    }

    async fn active_configuration(&self) -> Result<Option<ConfigurationRecord>, ConfigStoreError> {
        match self.db.get(ACTIVE_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}
