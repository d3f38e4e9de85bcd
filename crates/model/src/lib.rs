pub mod cancel;
pub mod changelog;
pub mod core;
pub mod datasource;
pub mod events;
pub mod records;
