use crate::error::ConfigStoreError;
use async_trait::async_trait;
use model::datasource::DataSourceConfiguration;

pub mod models;
pub mod sled_store;

pub use models::ConfigurationRecord;
pub use sled_store::SledConfigurationStore;

/// Persists which data source the application uses.
#[async_trait]
pub trait ConfigurationService: Send + Sync {
    /// Makes `config` the active configuration. `previous` is kept with it
    /// so an operator can see what was replaced.
    async fn save_data_source_configuration(
        &self,
        config: &DataSourceConfiguration,
        previous: Option<&DataSourceConfiguration>,
    ) -> Result<(), ConfigStoreError>;

    async fn active_configuration(&self) -> Result<Option<ConfigurationRecord>, ConfigStoreError>;
}
