use model::cancel::Canceled;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatchError {
    #[error("Resource is already latched (latch id {0})")]
    AlreadyLatched(String),

    #[error("Cluster latch requested but no cluster propagator is configured")]
    ClusterUnavailable,

    #[error("Failed to propagate latch '{id}' to the cluster: {reason}")]
    Propagation { id: String, reason: String },

    #[error("{0}")]
    Canceled(#[from] Canceled),
}

#[derive(Error, Debug)]
pub enum ConfigStoreError {
    #[error("Failed to save data source configuration: {0}")]
    Save(String),

    #[error("Failed to load data source configuration: {0}")]
    Load(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}
