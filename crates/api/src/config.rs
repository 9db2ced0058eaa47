//! Application configuration

use std::env;

use kampung_billing::{BillingConfig, BillingError};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_allowed_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Authentication
    pub jwt_secret: String,

    // Billing
    pub billing: BillingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            run_migrations: env::var("RUN_MIGRATIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            billing: BillingConfig::from_env()?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid billing configuration: {0}")]
    Billing(#[from] BillingError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn setup_config() {
        env::set_var("DATABASE_URL", "postgres://localhost/kampung_test");
        env::set_var("JWT_SECRET", "test-secret-key-at-least-32-chars!");
        env::set_var("MANUAL_ACCOUNT_NUMBER", "1234567890");
        env::remove_var("PLATFORM_FEE_PERCENT");
        env::remove_var("CORS_ALLOWED_ORIGINS");
    }

    fn cleanup_config() {
        for key in [
            "DATABASE_URL",
            "JWT_SECRET",
            "MANUAL_ACCOUNT_NUMBER",
            "PLATFORM_FEE_PERCENT",
            "CORS_ALLOWED_ORIGINS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_config_loads_with_defaults() {
        setup_config();
        env::set_var(
            "CORS_ALLOWED_ORIGINS",
            "https://app.kampung.id, https://admin.kampung.id",
        );

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 20);
        assert_eq!(config.billing.platform_fee.basis_points(), 500);
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://app.kampung.id", "https://admin.kampung.id"]
        );

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_short_jwt_secret_rejected() {
        setup_config();
        env::set_var("JWT_SECRET", "short");

        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_missing_database_url_rejected() {
        setup_config();
        env::remove_var("DATABASE_URL");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_out_of_range_fee_rejected_at_startup() {
        setup_config();
        env::set_var("PLATFORM_FEE_PERCENT", "101");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Billing(BillingError::Config(_)))
        ));

        cleanup_config();
    }
}
