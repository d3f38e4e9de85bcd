use connectors::error::DataAccessError;
use engine_core::{
    deferred::Unusable,
    error::{ConfigStoreError, LatchError},
};
use model::{cancel::Canceled, changelog::ChangelogError};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub const KEY_FAILED: &str = "migration.failed";
pub const KEY_CANCELED: &str = "migration.canceled";
pub const KEY_LATCH_FAILED: &str = "migration.latch_failed";

/// Errors raised by a single step. A cancellation anywhere below stays
/// reachable through `source()`.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Canceled(#[from] Canceled),

    #[error("Data access error: {0}")]
    DataAccess(#[from] DataAccessError),

    #[error("Latch error: {0}")]
    Latch(#[from] LatchError),

    #[error("Invalid changelog: {0}")]
    Changelog(#[from] ChangelogError),

    #[error("Configuration store error: {0}")]
    ConfigStore(#[from] ConfigStoreError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Blob {id} is unusable: {reason}")]
    Blob { id: String, reason: String },

    #[error("Database did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("{0}")]
    Unusable(#[from] Unusable),

    #[error("Step '{0}' has already run")]
    AlreadyRan(String),
}

impl StepError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StepError::Io {
            path: path.into(),
            source,
        }
    }
}

/// What a migration task reports to its caller. Operators are shown
/// [`MigrationError::message_key`], the cause goes to the logs.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("{0}")]
    Canceled(#[from] Canceled),

    #[error("Migration failed: {source}")]
    Failed {
        message_key: &'static str,
        #[source]
        source: StepError,
    },

    #[error("Could not latch the database: {0}")]
    Latch(#[from] LatchError),

    #[error("Migration task {0} was already started")]
    AlreadyStarted(String),
}

impl MigrationError {
    pub fn message_key(&self) -> &'static str {
        match self {
            MigrationError::Canceled(_) => KEY_CANCELED,
            MigrationError::Failed { message_key, .. } => *message_key,
            MigrationError::Latch(_) => KEY_LATCH_FAILED,
            MigrationError::AlreadyStarted(_) => KEY_FAILED,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, MigrationError::Canceled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::cancel::is_cancellation;

    #[test]
    fn cancellation_survives_wrapping() {
        let err = StepError::from(DataAccessError::from(Canceled));
        assert!(is_cancellation(&err));

        let err = StepError::from(LatchError::from(Canceled));
        assert!(is_cancellation(&err));

        let err = StepError::from(DataAccessError::TableNotFound("users".into()));
        assert!(!is_cancellation(&err));
    }

    #[test]
    fn failed_carries_message_key() {
        let err = MigrationError::Failed {
            message_key: KEY_FAILED,
            source: StepError::DrainTimeout(Duration::from_secs(1)),
        };
        assert_eq!(err.message_key(), "migration.failed");
        assert!(!err.is_canceled());
    }
}
