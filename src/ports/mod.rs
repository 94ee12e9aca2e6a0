//! Port traits the core depends on.

pub mod bar_store;
pub mod broker;
pub mod config_port;
pub mod persistence;
