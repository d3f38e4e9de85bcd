#![allow(dead_code)]

use connectors::handle::DatabaseHandle;
use model::datasource::DataSourceConfiguration;
use std::path::Path;

pub mod integration;
pub mod utils;

/// Fresh in-memory database.
pub fn memory_db(name: &str) -> DatabaseHandle {
    DatabaseHandle::connect(DataSourceConfiguration::memory(name)).expect("open memory database")
}

/// Fresh sled database under `dir`.
pub fn sled_db(dir: &Path, name: &str) -> DatabaseHandle {
    let path = dir.join(name);
    DatabaseHandle::connect(DataSourceConfiguration::sled(path.to_string_lossy()))
        .expect("open sled database")
}
