//! Subscribe action
//!
//! Issues the invoice a tenant pays to start (or renew early, or upgrade to
//! lifetime) a subscription. Asking twice for the same plan returns the open
//! invoice instead of creating another one.

use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use kampung_shared::types::{
    Invoice, InvoiceType, Subscription, SubscriptionType, Tenant, TenantStatus, TenantType,
};

use crate::config::{BillingConfig, PlanCatalog, PlanPrice};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices::{self, NewInvoice};

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeOutcome {
    pub invoice: Invoice,
    /// False when an open invoice for the plan already existed
    pub created: bool,
}

/// Period an invoice for `price` would cover
pub fn subscription_period(
    price: &PlanPrice,
    current: Option<&Subscription>,
    now: OffsetDateTime,
) -> BillingResult<(OffsetDateTime, Option<OffsetDateTime>, Option<Uuid>)> {
    if current.is_some_and(|s| s.is_active_lifetime()) {
        return Err(BillingError::StateConflict(
            "Tenant already holds a lifetime subscription".to_string(),
        ));
    }

    if price.subscription_type == SubscriptionType::Lifetime {
        return Ok((now, None, None));
    }

    // Paying while a period is still running buys the following period
    let (start, subscription_id) = match current.and_then(|s| s.ends_at.map(|end| (s.id, end))) {
        Some((id, ends_at)) if ends_at > now => (ends_at + Duration::seconds(1), Some(id)),
        _ => (now, None),
    };

    let end = price.subscription_type.advance(start);
    Ok((start, end, subscription_id))
}

/// Subscribe service
pub struct SubscribeService {
    pool: PgPool,
    plans: PlanCatalog,
}

impl SubscribeService {
    pub fn new(pool: PgPool, config: &BillingConfig) -> Self {
        Self {
            pool,
            plans: config.plans.clone(),
        }
    }

    pub async fn subscribe(
        &self,
        tenant_id: Uuid,
        plan_code: &str,
        actor_id: Uuid,
    ) -> BillingResult<SubscribeOutcome> {
        let price = self
            .plans
            .price(plan_code)
            .ok_or_else(|| BillingError::Validation(format!("Unknown plan: {}", plan_code)))?;

        let mut tx = self.pool.begin().await?;

        let tenant = sqlx::query_as::<_, Tenant>(
            "SELECT * FROM tenants WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Tenant {} not found", tenant_id)))?;

        if tenant.tenant_type == TenantType::Demo || tenant.status == TenantStatus::Demo {
            return Err(BillingError::PermissionDenied(
                "Demo tenants cannot subscribe".to_string(),
            ));
        }

        let parent = match tenant.parent_tenant_id {
            Some(parent_id) => {
                sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1 AND deleted_at IS NULL")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };
        tenant.validate_hierarchy(parent.as_ref()).map_err(|e| {
            tracing::error!(tenant_id = %tenant_id, error = %e, "Tenant tree is inconsistent");
            BillingError::StateConflict(e.to_string())
        })?;

        if let Some(existing) = invoices::find_open_for_plan(&mut *tx, tenant_id, plan_code).await? {
            tracing::debug!(
                tenant_id = %tenant_id,
                invoice_id = %existing.id,
                "Returning existing open invoice"
            );
            return Ok(SubscribeOutcome {
                invoice: existing,
                created: false,
            });
        }

        let current: Option<Subscription> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE tenant_id = $1 AND status = 'ACTIVE'")
                .bind(tenant_id)
                .fetch_optional(&mut *tx)
                .await?;

        let now = OffsetDateTime::now_utc();
        let (start, end, subscription_id) = subscription_period(&price, current.as_ref(), now)?;

        let new = NewInvoice {
            tenant_id,
            billing_owner_id: tenant.effective_billing_owner(),
            invoice_type: match price.subscription_type {
                SubscriptionType::Lifetime => InvoiceType::Lifetime,
                _ => InvoiceType::Subscription,
            },
            plan_code: plan_code.to_string(),
            subscription_id,
            amount: price.amount,
            service_period_start: start,
            service_period_end: end,
        };

        let invoice = invoices::insert_unpaid(&mut *tx, &new, now)
            .await?
            .ok_or_else(|| {
                BillingError::StateConflict(
                    "An open invoice already covers the next period".to_string(),
                )
            })?;

        let event = BillingEventBuilder::new(tenant_id, BillingEventType::InvoiceCreated)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "invoice_number": invoice.invoice_number,
                "plan_code": plan_code,
                "amount": invoice.amount,
            }))
            .actor(actor_id, ActorType::User);
        BillingEventLogger::log_event_on(&mut *tx, event).await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            invoice_id = %invoice.id,
            plan_code = %plan_code,
            amount = invoice.amount,
            "Subscription invoice issued"
        );

        Ok(SubscribeOutcome {
            invoice,
            created: true,
        })
    }
}
