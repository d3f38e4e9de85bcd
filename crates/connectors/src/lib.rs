pub mod accessor;
pub mod error;
pub mod handle;
pub mod memory;
pub mod schema;
pub mod sled_store;
