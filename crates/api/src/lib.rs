//! Kampung API Library
//!
//! HTTP surface of tenant billing: subscribe, invoices, payments, provider webhooks,
//! and the per-request tenant status gate.

pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
