//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use kampung_billing::{BillingResult, BillingService};

use crate::auth::{AuthState, JwtManager};
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub billing: Arc<BillingService>,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> BillingResult<Self> {
        let billing = BillingService::new(pool.clone(), &config.billing)?;
        let jwt_manager = JwtManager::new(&config.jwt_secret);

        Ok(Self {
            pool,
            config: Arc::new(config),
            billing: Arc::new(billing),
            jwt_manager,
        })
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
