pub mod database;
pub mod deferred;
pub mod error;
pub mod event_bus;
pub mod latch;
pub mod progress;
pub mod state;
