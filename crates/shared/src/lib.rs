#![cfg_attr(test, allow(clippy::expect_used))]

//! Kampung Shared Types and Utilities
//!
//! This crate contains the tenant billing data model, errors, and database helpers
//! shared across the Kampung platform.

pub mod db;
pub mod error;
pub mod telemetry;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
