use model::cancel::Canceled;
use thiserror::Error;

/// Errors raised by a changelog accessor.
///
/// `TableNotFound` means source and target schemas disagree and is never
/// retried or swallowed. `ChangeFailed` carries the identity of the change
/// that could not be applied.
#[derive(Debug, Error)]
pub enum DataAccessError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Failed to apply change '{change}': {reason}")]
    ChangeFailed { change: String, reason: String },

    #[error("Changeset bracketing error: {0}")]
    ChangeSetState(String),

    #[error("Schema lock is already held on {0}")]
    Locked(String),

    #[error("Database handle is closed: {0}")]
    Closed(String),

    #[error("Operation interrupted while {0} was being drained")]
    Interrupted(String),

    #[error("Unsupported data source: {0}")]
    UnsupportedDataSource(String),

    #[error("{0}")]
    Canceled(#[from] Canceled),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DataAccessError {
    pub fn change_failed(change: impl ToString, reason: impl Into<String>) -> Self {
        DataAccessError::ChangeFailed {
            change: change.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error points at a schema mismatch rather than bad data.
    pub fn is_resource_missing(&self) -> bool {
        matches!(
            self,
            DataAccessError::TableNotFound(_) | DataAccessError::ColumnNotFound { .. }
        )
    }
}
