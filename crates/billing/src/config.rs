//! Billing configuration
//!
//! Everything here is validated when the configuration is loaded, so the
//! payment path never has to deal with a malformed fee or price table.

use std::collections::HashMap;
use std::time::Duration;

use kampung_shared::types::SubscriptionType;

use crate::error::{BillingError, BillingResult};

/// Default plan table used when `PLAN_PRICES` is not set (amounts in minor units)
const DEFAULT_PLAN_PRICES: &str =
    "rt_monthly=MONTHLY:50000,rt_yearly=YEARLY:500000,rt_lifetime=LIFETIME:3000000,\
     rw_monthly=MONTHLY:150000,rw_yearly=YEARLY:1500000,rw_lifetime=LIFETIME:9000000";

/// Platform share of split payments, stored in basis points (1% = 100)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeRate {
    basis_points: u32,
}

impl FeeRate {
    pub const MAX_BASIS_POINTS: u32 = 10_000;

    pub fn from_basis_points(basis_points: u32) -> BillingResult<Self> {
        if basis_points > Self::MAX_BASIS_POINTS {
            return Err(BillingError::Config(format!(
                "Platform fee must be within 0..=100 percent, got {} basis points",
                basis_points
            )));
        }
        Ok(Self { basis_points })
    }

    /// Parse a percentage such as `5`, `2.5` or `12.75`.
    pub fn parse_percent(raw: &str) -> BillingResult<Self> {
        let raw = raw.trim();
        let invalid = || BillingError::Config(format!("Invalid platform fee percent: {:?}", raw));

        let (whole, fraction) = match raw.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (raw, ""),
        };
        if whole.is_empty() || fraction.len() > 2 {
            return Err(invalid());
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole: u32 = whole.parse().map_err(|_| invalid())?;
        let fraction: u32 = if fraction.is_empty() {
            0
        } else {
            // "5" after the point means 50 hundredths
            format!("{:0<2}", fraction).parse().map_err(|_| invalid())?
        };

        let basis_points = whole
            .checked_mul(100)
            .and_then(|bp| bp.checked_add(fraction))
            .ok_or_else(invalid)?;
        Self::from_basis_points(basis_points)
    }

    pub fn basis_points(&self) -> u32 {
        self.basis_points
    }

    /// floor(amount × rate). Amounts are non-negative minor units.
    pub fn platform_share(&self, amount: i64) -> i64 {
        let share = (amount as i128 * self.basis_points as i128) / Self::MAX_BASIS_POINTS as i128;
        share as i64
    }
}

/// Price and cadence of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPrice {
    pub subscription_type: SubscriptionType,
    pub amount: i64,
}

/// The single plan-code → price table used by subscribe, renewal and activation
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: HashMap<String, PlanPrice>,
}

impl PlanCatalog {
    pub fn new(plans: HashMap<String, PlanPrice>) -> Self {
        Self { plans }
    }

    /// Parse `code=TYPE:amount` entries separated by commas.
    pub fn parse(raw: &str) -> BillingResult<Self> {
        let mut plans = HashMap::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = || BillingError::Config(format!("Invalid plan price entry: {:?}", entry));

            let (code, spec) = entry.split_once('=').ok_or_else(invalid)?;
            let (kind, amount) = spec.split_once(':').ok_or_else(invalid)?;
            let code = code.trim();
            if code.is_empty() {
                return Err(invalid());
            }

            let subscription_type: SubscriptionType =
                kind.trim().parse().map_err(BillingError::Config)?;
            let amount: i64 = amount.trim().parse().map_err(|_| invalid())?;
            if amount < 0 {
                return Err(BillingError::Config(format!(
                    "Plan {} has a negative price",
                    code
                )));
            }

            if plans
                .insert(code.to_string(), PlanPrice { subscription_type, amount })
                .is_some()
            {
                return Err(BillingError::Config(format!("Plan {} defined twice", code)));
            }
        }

        if plans.is_empty() {
            return Err(BillingError::Config("No plans configured".to_string()));
        }

        Ok(Self { plans })
    }

    pub fn price(&self, plan_code: &str) -> Option<PlanPrice> {
        self.plans.get(plan_code).copied()
    }

    pub fn require(&self, plan_code: &str) -> BillingResult<PlanPrice> {
        self.price(plan_code)
            .ok_or_else(|| BillingError::UnknownPlan(plan_code.to_string()))
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// External payment engine used for digital channels
#[derive(Debug, Clone)]
pub struct PaymentEngineConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Provider name recorded on invoices and used in the webhook path
    pub provider_name: String,
    /// HMAC secret for provider webhooks
    pub webhook_secret: String,
}

/// Bank account shown on manual transfer instructions
#[derive(Debug, Clone)]
pub struct ManualTransferConfig {
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
}

/// Configuration for tenant billing
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub platform_fee: FeeRate,
    pub plans: PlanCatalog,
    pub payment_engine: PaymentEngineConfig,
    pub manual_transfer: ManualTransferConfig,
    /// How far ahead of expiry renewal invoices are issued
    pub renewal_window_days: i64,
}

/// Upper bound for `RENEWAL_WINDOW_DAYS`
pub const MAX_RENEWAL_WINDOW_DAYS: i64 = 365;

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let platform_fee = FeeRate::parse_percent(
            &std::env::var("PLATFORM_FEE_PERCENT").unwrap_or_else(|_| "5".to_string()),
        )?;

        let plans = PlanCatalog::parse(
            &std::env::var("PLAN_PRICES").unwrap_or_else(|_| DEFAULT_PLAN_PRICES.to_string()),
        )?;

        let timeout_ms: u64 = std::env::var("PAYMENT_ENGINE_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .map_err(|_| {
                BillingError::Config("PAYMENT_ENGINE_TIMEOUT_MS must be an integer".to_string())
            })?;

        let renewal_window_days: i64 = std::env::var("RENEWAL_WINDOW_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .map_err(|_| BillingError::Config("RENEWAL_WINDOW_DAYS must be an integer".to_string()))?;
        if !(1..=MAX_RENEWAL_WINDOW_DAYS).contains(&renewal_window_days) {
            return Err(BillingError::Config(format!(
                "RENEWAL_WINDOW_DAYS must be between 1 and {}",
                MAX_RENEWAL_WINDOW_DAYS
            )));
        }

        Ok(Self {
            platform_fee,
            plans,
            payment_engine: PaymentEngineConfig {
                base_url: std::env::var("PAYMENT_ENGINE_URL")
                    .unwrap_or_else(|_| "http://localhost:8090".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                timeout: Duration::from_millis(timeout_ms),
                provider_name: std::env::var("PAYMENT_PROVIDER_NAME")
                    .unwrap_or_else(|_| "payment_engine".to_string()),
                webhook_secret: std::env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_default(),
            },
            manual_transfer: ManualTransferConfig {
                bank_name: std::env::var("MANUAL_BANK_NAME")
                    .unwrap_or_else(|_| "Bank Central Asia".to_string()),
                account_number: std::env::var("MANUAL_ACCOUNT_NUMBER")
                    .map_err(|_| BillingError::Config("MANUAL_ACCOUNT_NUMBER not set".to_string()))?,
                account_holder: std::env::var("MANUAL_ACCOUNT_HOLDER")
                    .unwrap_or_else(|_| "PT Kampung Digital".to_string()),
            },
            renewal_window_days,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_fee_percent_parsing() {
        assert_eq!(FeeRate::parse_percent("5").unwrap().basis_points(), 500);
        assert_eq!(FeeRate::parse_percent("2.5").unwrap().basis_points(), 250);
        assert_eq!(FeeRate::parse_percent("12.75").unwrap().basis_points(), 1275);
        assert_eq!(FeeRate::parse_percent("0").unwrap().basis_points(), 0);
        assert_eq!(FeeRate::parse_percent("100").unwrap().basis_points(), 10_000);
    }

    #[test]
    fn test_fee_percent_out_of_range_rejected() {
        assert!(matches!(FeeRate::parse_percent("100.01"), Err(BillingError::Config(_))));
        assert!(matches!(FeeRate::parse_percent("150"), Err(BillingError::Config(_))));
        assert!(matches!(FeeRate::parse_percent("-1"), Err(BillingError::Config(_))));
        assert!(matches!(FeeRate::parse_percent("1.234"), Err(BillingError::Config(_))));
        assert!(matches!(FeeRate::parse_percent("abc"), Err(BillingError::Config(_))));
        assert!(matches!(FeeRate::parse_percent(""), Err(BillingError::Config(_))));
    }

    #[test]
    fn test_platform_share_floors() {
        let fee = FeeRate::parse_percent("5").unwrap();
        assert_eq!(fee.platform_share(150_000), 7_500);
        assert_eq!(fee.platform_share(19), 0);
        assert_eq!(fee.platform_share(0), 0);

        let fee = FeeRate::parse_percent("2.5").unwrap();
        assert_eq!(fee.platform_share(99), 2);
    }

    #[test]
    fn test_plan_catalog_parsing() {
        let catalog = PlanCatalog::parse("basic=MONTHLY:50000, basic_y=YEARLY:500000").unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.price("basic_y"),
            Some(PlanPrice {
                subscription_type: SubscriptionType::Yearly,
                amount: 500_000
            })
        );
        assert!(catalog.price("gold").is_none());
        assert!(matches!(catalog.require("gold"), Err(BillingError::UnknownPlan(_))));
    }

    #[test]
    fn test_plan_catalog_rejects_bad_entries() {
        assert!(PlanCatalog::parse("basic=WEEKLY:100").is_err());
        assert!(PlanCatalog::parse("basic=MONTHLY").is_err());
        assert!(PlanCatalog::parse("basic=MONTHLY:-5").is_err());
        assert!(PlanCatalog::parse("a=MONTHLY:1,a=YEARLY:2").is_err());
        assert!(PlanCatalog::parse("").is_err());
    }

    #[test]
    fn test_default_plan_table_is_valid() {
        let catalog = PlanCatalog::parse(DEFAULT_PLAN_PRICES).unwrap();
        assert_eq!(
            catalog.price("rt_lifetime").map(|p| p.subscription_type),
            Some(SubscriptionType::Lifetime)
        );
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_fee_out_of_range() {
        std::env::set_var("MANUAL_ACCOUNT_NUMBER", "1234567890");
        std::env::set_var("PLATFORM_FEE_PERCENT", "120");
        let result = BillingConfig::from_env();
        assert!(matches!(result, Err(BillingError::Config(_))));

        std::env::set_var("PLATFORM_FEE_PERCENT", "5");
        let config = BillingConfig::from_env().unwrap();
        assert_eq!(config.platform_fee.basis_points(), 500);
        assert_eq!(config.payment_engine.timeout, Duration::from_millis(5000));
        assert_eq!(config.renewal_window_days, 7);

        std::env::remove_var("PLATFORM_FEE_PERCENT");
        std::env::remove_var("MANUAL_ACCOUNT_NUMBER");
    }

    #[test]
    #[serial]
    fn test_from_env_bounds_renewal_window() {
        std::env::set_var("MANUAL_ACCOUNT_NUMBER", "1234567890");

        for bad in ["0", "-3", "366", "9223372036854775807"] {
            std::env::set_var("RENEWAL_WINDOW_DAYS", bad);
            assert!(
                matches!(BillingConfig::from_env(), Err(BillingError::Config(_))),
                "{}",
                bad
            );
        }

        std::env::set_var("RENEWAL_WINDOW_DAYS", "365");
        assert_eq!(BillingConfig::from_env().unwrap().renewal_window_days, 365);

        std::env::remove_var("RENEWAL_WINDOW_DAYS");
        std::env::remove_var("MANUAL_ACCOUNT_NUMBER");
    }
}
