use crate::events::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the two databases a migration moves between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationEndpoints {
    pub task_id: String,
    pub source: String,
    pub target: String,
}

/// Emitted when a migration task starts running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStarted {
    pub endpoints: MigrationEndpoints,
    pub message_key: String,
    pub timestamp: DateTime<Utc>,
}

impl Event for MigrationStarted {
    fn event_type(&self) -> &'static str {
        "migration.started"
    }
}

/// Emitted once the target configuration is active and the source is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSucceeded {
    pub endpoints: MigrationEndpoints,
    pub message_key: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl Event for MigrationSucceeded {
    fn event_type(&self) -> &'static str {
        "migration.succeeded"
    }
}

/// Emitted when a migration fails and control has been returned to the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationFailed {
    pub endpoints: MigrationEndpoints,
    pub message_key: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl Event for MigrationFailed {
    fn event_type(&self) -> &'static str {
        "migration.failed"
    }
}

/// Emitted when a migration unwinds after a cancellation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationCanceled {
    pub endpoints: MigrationEndpoints,
    pub message_key: String,
    pub timestamp: DateTime<Utc>,
}

impl Event for MigrationCanceled {
    fn event_type(&self) -> &'static str {
        "migration.canceled"
    }
}

impl fmt::Display for MigrationEndpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} -> {}", self.task_id, self.source, self.target)
    }
}

impl fmt::Display for MigrationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}): {}",
            self.timestamp.to_rfc3339(),
            self.endpoints,
            self.message_key,
            self.error
        )
    }
}
