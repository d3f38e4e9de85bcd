use crate::latch::{Latch, LatchableService};
use async_trait::async_trait;
use connectors::handle::DatabaseHandle;

pub mod latched;
pub mod manager;

pub use latched::LatchedAccessor;
pub use manager::{DefaultDatabaseManager, ManagedDatabaseLatch};

/// A latch on the database manager.
#[async_trait]
pub trait DatabaseLatch: Latch {
    /// Makes `handle` the current database, then unlatches. Operations
    /// admitted afterwards only ever see `handle`.
    async fn unlatch_to(&self, handle: DatabaseHandle);
}

/// Owner of the database the application is currently using.
pub trait DatabaseManager: LatchableService<Latch = dyn DatabaseLatch> {
    fn handle(&self) -> DatabaseHandle;
}
