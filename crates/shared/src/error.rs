//! Error types for Kampung

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KampungError {
    #[error("Invalid tenant hierarchy: {0}")]
    InvalidHierarchy(String),
}
