use connectors::error::DataAccessError;
use engine_config::error::SettingsError;
use engine_core::error::ConfigStoreError;
use engine_runtime::error::{MigrationError, StepError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read or write a file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error("{0}")]
    Config(String),

    #[error("Failed to open database: {0}")]
    Connect(#[from] DataAccessError),

    #[error("Failed to open configuration store: {0}")]
    ConfigStore(#[from] ConfigStoreError),

    #[error("{0}")]
    Step(#[from] StepError),

    #[error("Migration failed ({}): {}", .0.message_key(), .0)]
    Migration(#[from] MigrationError),

    #[error("Failed to serialize data to JSON: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("Shutdown requested")]
    ShutdownRequested,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_error_shows_message_key() {
        let err = CliError::from(MigrationError::AlreadyStarted("task-1".into()));
        assert_eq!(
            err.to_string(),
            "Migration failed (migration.failed): Migration task task-1 was already started"
        );
    }
}
