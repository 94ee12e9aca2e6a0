//! Core domain types and logic.

pub mod bar;
pub mod config_validation;
pub mod decision;
pub mod error;
pub mod indicator;
pub mod ledger;
pub mod pipeline;
pub mod retry;
pub mod risk;
pub mod signal;
pub mod tracker;
pub mod trade;
