pub mod backup;
pub mod finalize;
pub mod maintenance;
pub mod phase;
pub mod restore;
pub mod standalone;
pub mod step;
pub mod task;

pub use phase::{Phase, PhaseBuilder};
pub use step::Step;
pub use task::{MigrationTask, MigrationTaskParams, TaskState};

pub const KEY_MIGRATION: &str = "migration";
pub const KEY_MAINTENANCE: &str = "migration.maintenance";
pub const KEY_BACKUP: &str = "migration.backup";
pub const KEY_RESTORE: &str = "migration.restore";
pub const KEY_FINALIZE: &str = "migration.finalize";
