//! Concrete adapter implementations for ports.

pub mod csv_adapter;
pub mod file_config_adapter;
pub mod memory_store;
pub mod paper_broker;
#[cfg(feature = "sqlite")]
pub mod sqlite_adapter;
