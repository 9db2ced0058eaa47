//! Authentication boundary for the Kampung API
//!
//! Tokens are issued by the external auth service; this crate only validates them.

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_auth, AuthState, AuthUser};
