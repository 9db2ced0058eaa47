//! Renewal Invoice Scheduler
//!
//! Daily batch that issues next-period invoices for subscriptions about to end.
//!
//! Each subscription is processed in its own transaction so one failure cannot
//! roll back another's invoice. Running the pass twice is harmless: a pending
//! invoice short-circuits the second run, and the open-invoice unique index
//! turns a concurrent duplicate insert into a no-op.

use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use kampung_shared::types::{InvoiceType, Subscription, SubscriptionType};

use crate::config::{BillingConfig, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices::{self, NewInvoice};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalDecision {
    /// An UNPAID invoice for the next period already exists
    AlreadyPending,
    Create {
        service_period_start: OffsetDateTime,
        service_period_end: OffsetDateTime,
        amount: i64,
    },
}

/// Decide whether and how to renew `sub`.
///
/// `latest_pending_start` is the newest `service_period_start` among the
/// subscription's UNPAID invoices.
pub fn plan_renewal(
    sub: &Subscription,
    latest_pending_start: Option<OffsetDateTime>,
    plans: &PlanCatalog,
) -> BillingResult<RenewalDecision> {
    let ends_at = sub.ends_at.ok_or_else(|| {
        BillingError::Validation(format!("Subscription {} has no end date", sub.id))
    })?;

    if latest_pending_start.is_some_and(|start| start >= ends_at) {
        return Ok(RenewalDecision::AlreadyPending);
    }

    let price = plans.require(&sub.plan_code)?;
    let next_start = ends_at + Duration::seconds(1);
    let next_end = match price.subscription_type {
        SubscriptionType::Lifetime => None,
        cadence => cadence.advance(next_start),
    }
    .ok_or_else(|| {
        BillingError::Validation(format!(
            "Plan {} of subscription {} is not renewable",
            sub.plan_code, sub.id
        ))
    })?;

    Ok(RenewalDecision::Create {
        service_period_start: next_start,
        service_period_end: next_end,
        amount: price.amount,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewalFailure {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenewalReport {
    pub examined: usize,
    pub created: usize,
    pub skipped: usize,
    pub failures: Vec<RenewalFailure>,
}

enum RenewalOutcome {
    Created(Uuid),
    Skipped,
}

/// Renewal scheduler service
pub struct RenewalService {
    pool: PgPool,
    plans: PlanCatalog,
    window: Duration,
}

impl RenewalService {
    pub fn new(pool: PgPool, config: &BillingConfig) -> Self {
        Self {
            pool,
            plans: config.plans.clone(),
            window: Duration::days(config.renewal_window_days),
        }
    }

    /// Issue renewal invoices for subscriptions ending in `(now, now + window]`
    pub async fn run_renewal_pass(&self, now: OffsetDateTime) -> BillingResult<RenewalReport> {
        let due: Vec<Subscription> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'ACTIVE'
              AND subscription_type <> 'LIFETIME'
              AND ends_at > $1
              AND ends_at <= $2
            ORDER BY ends_at ASC
            "#,
        )
        .bind(now)
        .bind(now + self.window)
        .fetch_all(&self.pool)
        .await?;

        let mut report = RenewalReport {
            examined: due.len(),
            ..Default::default()
        };

        for sub in &due {
            match self.renew_one(sub, now).await {
                Ok(RenewalOutcome::Created(invoice_id)) => {
                    report.created += 1;
                    tracing::info!(
                        subscription_id = %sub.id,
                        tenant_id = %sub.tenant_id,
                        invoice_id = %invoice_id,
                        "Renewal invoice created"
                    );
                }
                Ok(RenewalOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %sub.id,
                        tenant_id = %sub.tenant_id,
                        plan_code = %sub.plan_code,
                        error = %e,
                        "Failed to create renewal invoice"
                    );
                    report.failures.push(RenewalFailure {
                        subscription_id: sub.id,
                        tenant_id: sub.tenant_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            created = report.created,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Renewal pass complete"
        );

        Ok(report)
    }

    async fn renew_one(&self, sub: &Subscription, now: OffsetDateTime) -> BillingResult<RenewalOutcome> {
        let mut tx = self.pool.begin().await?;

        // Re-read under lock; the subscription may have changed since selection
        let Some(sub) = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE id = $1 AND status = 'ACTIVE' FOR UPDATE",
        )
        .bind(sub.id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(RenewalOutcome::Skipped);
        };

        let (latest_pending_start,): (Option<OffsetDateTime>,) = sqlx::query_as(
            r#"
            SELECT MAX(service_period_start)
            FROM invoices
            WHERE tenant_id = $1
              AND (subscription_id = $2 OR subscription_id IS NULL)
              AND status = 'UNPAID'
            "#,
        )
        .bind(sub.tenant_id)
        .bind(sub.id)
        .fetch_one(&mut *tx)
        .await?;

        let (service_period_start, service_period_end, amount) =
            match plan_renewal(&sub, latest_pending_start, &self.plans)? {
                RenewalDecision::AlreadyPending => return Ok(RenewalOutcome::Skipped),
                RenewalDecision::Create {
                    service_period_start,
                    service_period_end,
                    amount,
                } => (service_period_start, service_period_end, amount),
            };

        let billing_owner_id: Option<(Uuid,)> = sqlx::query_as(
            "SELECT COALESCE(billing_owner_id, id) FROM tenants WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(sub.tenant_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (billing_owner_id,) = billing_owner_id.ok_or_else(|| {
            BillingError::NotFound(format!("Tenant {} of subscription {} not found", sub.tenant_id, sub.id))
        })?;

        let new = NewInvoice {
            tenant_id: sub.tenant_id,
            billing_owner_id,
            invoice_type: InvoiceType::Subscription,
            plan_code: sub.plan_code.clone(),
            subscription_id: Some(sub.id),
            amount,
            service_period_start,
            service_period_end: Some(service_period_end),
        };

        let Some(invoice) = invoices::insert_unpaid(&mut *tx, &new, now).await? else {
            // Another pass won the race for this period
            return Ok(RenewalOutcome::Skipped);
        };

        let event = BillingEventBuilder::new(sub.tenant_id, BillingEventType::RenewalInvoiceCreated)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "subscription_id": sub.id,
                "invoice_number": invoice.invoice_number,
                "amount": amount,
                "service_period_start": service_period_start.unix_timestamp(),
                "service_period_end": service_period_end.unix_timestamp(),
            }));
        BillingEventLogger::log_event_on(&mut *tx, event).await?;

        tx.commit().await?;
        Ok(RenewalOutcome::Created(invoice.id))
    }

    /// Mark ACTIVE subscriptions whose period is over as EXPIRED. Returns the count.
    pub async fn expire_lapsed_subscriptions(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            WITH lapsed AS (
                UPDATE subscriptions
                SET status = 'EXPIRED', updated_at = NOW()
                WHERE status = 'ACTIVE'
                  AND subscription_type <> 'LIFETIME'
                  AND ends_at < $1
                RETURNING id, tenant_id, ends_at
            )
            INSERT INTO billing_events (tenant_id, event_type, event_data, actor_type)
            SELECT tenant_id,
                   'SUBSCRIPTION_LAPSED',
                   jsonb_build_object('subscription_id', id, 'ends_at', ends_at),
                   'system'
            FROM lapsed
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        let lapsed = result.rows_affected();
        if lapsed > 0 {
            tracing::info!(lapsed = lapsed, "Expired lapsed subscriptions");
        }
        Ok(lapsed)
    }
}
