use chrono::{DateTime, Utc};
use model::datasource::DataSourceConfiguration;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConfigurationRecord {
    pub revision: u64,
    pub config: DataSourceConfiguration,
    pub previous: Option<DataSourceConfiguration>,
    pub saved_at: DateTime<Utc>,
}
