//! Payment strategy resolution
//!
//! Decides whether an invoice's proceeds go entirely to one party
//! (`Centralized`) or are split between the platform and the paying RW
//! (`Split`). Resolution is pure; [`crate::payment::PaymentService::pay`]
//! executes the chosen strategy.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kampung_shared::types::{InvoiceType, PaymentMode, TenantStatus};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStrategy {
    Centralized,
    Split,
}

impl PaymentStrategy {
    pub fn mode(&self) -> PaymentMode {
        match self {
            Self::Centralized => PaymentMode::Centralized,
            Self::Split => PaymentMode::Split,
        }
    }
}

/// Facts about an invoice and its payer needed to pick a strategy
#[derive(Debug, Clone)]
pub struct PaymentContext {
    pub tenant_id: Uuid,
    pub tenant_status: TenantStatus,
    pub invoice_type: InvoiceType,
    pub billing_owner_id: Uuid,
    /// Status of the billing owner, `None` when the owner row is missing
    pub owner_status: Option<TenantStatus>,
}

impl PaymentContext {
    pub fn is_self_billed(&self) -> bool {
        self.tenant_id == self.billing_owner_id
    }
}

/// First matching rule wins.
pub fn resolve_strategy(ctx: &PaymentContext) -> BillingResult<PaymentStrategy> {
    if ctx.tenant_status == TenantStatus::Demo {
        return Err(BillingError::PaymentNotAllowed(
            "Demo tenants cannot pay invoices".to_string(),
        ));
    }

    if ctx.invoice_type == InvoiceType::Lifetime {
        return Ok(PaymentStrategy::Centralized);
    }

    if ctx.is_self_billed() {
        return Ok(PaymentStrategy::Split);
    }

    match ctx.owner_status {
        Some(TenantStatus::Active) => Ok(PaymentStrategy::Split),
        _ => Ok(PaymentStrategy::Centralized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(tenant_status: TenantStatus, invoice_type: InvoiceType) -> PaymentContext {
        PaymentContext {
            tenant_id: Uuid::new_v4(),
            tenant_status,
            invoice_type,
            billing_owner_id: Uuid::new_v4(),
            owner_status: Some(TenantStatus::Active),
        }
    }

    #[test]
    fn test_demo_tenant_cannot_pay() {
        for invoice_type in [InvoiceType::Subscription, InvoiceType::Lifetime] {
            let result = resolve_strategy(&ctx(TenantStatus::Demo, invoice_type));
            assert!(matches!(result, Err(BillingError::PaymentNotAllowed(_))));
        }
    }

    #[test]
    fn test_lifetime_always_centralized() {
        let mut c = ctx(TenantStatus::Active, InvoiceType::Lifetime);
        assert_eq!(resolve_strategy(&c).ok(), Some(PaymentStrategy::Centralized));

        c.billing_owner_id = c.tenant_id;
        assert_eq!(resolve_strategy(&c).ok(), Some(PaymentStrategy::Centralized));
    }

    #[test]
    fn test_self_billed_subscription_is_split() {
        let mut c = ctx(TenantStatus::Expired, InvoiceType::Subscription);
        c.billing_owner_id = c.tenant_id;
        c.owner_status = Some(TenantStatus::Expired);
        assert_eq!(resolve_strategy(&c).ok(), Some(PaymentStrategy::Split));
    }

    #[test]
    fn test_active_owner_gets_split() {
        let c = ctx(TenantStatus::Trial, InvoiceType::Subscription);
        assert_eq!(resolve_strategy(&c).ok(), Some(PaymentStrategy::Split));
    }

    #[test]
    fn test_inactive_or_missing_owner_is_centralized() {
        for owner_status in [
            Some(TenantStatus::Expired),
            Some(TenantStatus::Trial),
            Some(TenantStatus::Demo),
            None,
        ] {
            let mut c = ctx(TenantStatus::Active, InvoiceType::Subscription);
            c.owner_status = owner_status;
            assert_eq!(
                resolve_strategy(&c).ok(),
                Some(PaymentStrategy::Centralized),
                "owner {:?}",
                owner_status
            );
        }
    }

    #[test]
    fn test_strategy_maps_to_payment_mode() {
        assert_eq!(PaymentStrategy::Split.mode(), PaymentMode::Split);
        assert_eq!(PaymentStrategy::Centralized.mode(), PaymentMode::Centralized);
    }
}
