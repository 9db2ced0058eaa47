//! Settlement and subscription activation
//!
//! Marks an invoice PAID and gives the tenant what it paid for, in one
//! transaction with the invoice row locked. Entry points are operator
//! confirmation of a manual transfer and payment-engine webhooks.
//!
//! A lifetime invoice cancels any running subscription and grants a lifetime
//! one. A subscription invoice extends the tenant's ACTIVE subscription (or the
//! lapsed one it was issued for) up to the paid period's end, or creates one.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use kampung_shared::types::{
    Invoice, InvoiceStatus, InvoiceType, Subscription, SubscriptionStatus, SubscriptionType,
    UserRole,
};

use crate::config::{BillingConfig, FeeRate, PlanCatalog};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::invoices;
use crate::payment::regenerate_ledger;

/// Where a settlement came from
#[derive(Debug, Clone)]
pub enum SettlementSource {
    Manual { operator_id: Uuid },
    Provider { name: String },
}

impl SettlementSource {
    fn actor(&self) -> (Option<Uuid>, ActorType) {
        match self {
            Self::Manual { operator_id } => (Some(*operator_id), ActorType::Operator),
            Self::Provider { .. } => (None, ActorType::PaymentEngine),
        }
    }
}

/// What activation will do to the tenant's subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationPlan {
    /// Cancel running subscriptions and create a lifetime one
    GrantLifetime,
    /// Tenant already holds a lifetime subscription
    AlreadyLifetime { subscription_id: Uuid },
    /// Move an existing subscription's end forward (reactivating it if lapsed)
    Extend {
        subscription_id: Uuid,
        subscription_type: SubscriptionType,
        ends_at: OffsetDateTime,
    },
    Create {
        subscription_type: SubscriptionType,
        starts_at: OffsetDateTime,
        ends_at: OffsetDateTime,
    },
}

/// Decide how a paid invoice changes the tenant's subscriptions.
///
/// `active` is the tenant's ACTIVE subscription, `linked` the subscription the
/// invoice was issued for (possibly lapsed).
pub fn plan_activation(
    invoice: &Invoice,
    active: Option<&Subscription>,
    linked: Option<&Subscription>,
    plans: &PlanCatalog,
) -> BillingResult<ActivationPlan> {
    if let Some(sub) = active.filter(|s| s.is_active_lifetime()) {
        return Ok(ActivationPlan::AlreadyLifetime {
            subscription_id: sub.id,
        });
    }

    if invoice.invoice_type == InvoiceType::Lifetime {
        return Ok(ActivationPlan::GrantLifetime);
    }

    let catalog_type = plans.price(&invoice.plan_code).map(|p| p.subscription_type);
    let period_end = match invoice.service_period_end {
        Some(end) => end,
        None => catalog_type
            .and_then(|t| t.advance(invoice.service_period_start))
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "Invoice {} has no service period end",
                    invoice.invoice_number
                ))
            })?,
    };

    let target = active.or(linked.filter(|s| s.subscription_type != SubscriptionType::Lifetime));

    match target {
        Some(sub) => {
            let ends_at = match sub.ends_at {
                Some(current) if current > period_end => current,
                _ => period_end,
            };
            Ok(ActivationPlan::Extend {
                subscription_id: sub.id,
                subscription_type: catalog_type
                    .filter(|t| *t != SubscriptionType::Lifetime)
                    .unwrap_or(sub.subscription_type),
                ends_at,
            })
        }
        None => {
            let subscription_type = catalog_type
                .filter(|t| *t != SubscriptionType::Lifetime)
                .ok_or_else(|| BillingError::UnknownPlan(invoice.plan_code.clone()))?;
            Ok(ActivationPlan::Create {
                subscription_type,
                starts_at: invoice.service_period_start,
                ends_at: period_end,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementOutcome {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    /// Invoice was already PAID; nothing changed
    pub already_paid: bool,
    pub subscription_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_ends_at: Option<OffsetDateTime>,
}

/// Activation service
pub struct ActivationService {
    pool: PgPool,
    fee: FeeRate,
    plans: PlanCatalog,
}

impl ActivationService {
    pub fn new(pool: PgPool, config: &BillingConfig) -> Self {
        Self {
            pool,
            fee: config.platform_fee,
            plans: config.plans.clone(),
        }
    }

    /// Operator confirms a manual bank transfer
    pub async fn confirm_manual(
        &self,
        invoice_id: Uuid,
        operator_id: Uuid,
        role: UserRole,
    ) -> BillingResult<SettlementOutcome> {
        if !role.can_confirm_payments() {
            return Err(BillingError::PermissionDenied(
                "Only platform operators can confirm payments".to_string(),
            ));
        }

        self.settle(invoice_id, SettlementSource::Manual { operator_id })
            .await
    }

    /// Payment engine reported the invoice as paid. Repeated notifications are no-ops.
    pub async fn settle_from_provider(
        &self,
        invoice_id: Uuid,
        provider: &str,
    ) -> BillingResult<SettlementOutcome> {
        self.settle(
            invoice_id,
            SettlementSource::Provider {
                name: provider.to_string(),
            },
        )
        .await
    }

    async fn settle(
        &self,
        invoice_id: Uuid,
        source: SettlementSource,
    ) -> BillingResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;
        let invoice = invoices::lock_invoice(&mut *tx, invoice_id).await?;

        match (invoice.status, &source) {
            (InvoiceStatus::Paid, SettlementSource::Provider { name }) => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    provider = %name,
                    "Duplicate payment notification ignored"
                );
                return Ok(SettlementOutcome {
                    invoice_id: invoice.id,
                    tenant_id: invoice.tenant_id,
                    already_paid: true,
                    subscription_id: invoice.subscription_id,
                    subscription_ends_at: None,
                });
            }
            (InvoiceStatus::Paid, SettlementSource::Manual { .. }) => {
                return Err(BillingError::StateConflict(format!(
                    "Invoice {} is already paid",
                    invoice.invoice_number
                )));
            }
            (InvoiceStatus::Canceled, _) => {
                return Err(BillingError::StateConflict(format!(
                    "Invoice {} is canceled",
                    invoice.invoice_number
                )));
            }
            (InvoiceStatus::Draft | InvoiceStatus::Unpaid, _) => {}
        }

        let now = OffsetDateTime::now_utc();
        let (actor_id, actor_type) = source.actor();

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'PAID', paid_at = $2, paid_by = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice.id)
        .bind(now)
        .bind(actor_id)
        .execute(&mut *tx)
        .await?;

        self.ensure_ledger(&mut *tx, &invoice).await?;

        let (subscription_id, ends_at) = self.activate(&mut *tx, &invoice, now).await?;

        let event = BillingEventBuilder::new(invoice.tenant_id, BillingEventType::InvoicePaid)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "amount": invoice.amount,
                "channel": invoice.payment_channel,
                "source": match &source {
                    SettlementSource::Manual { .. } => "manual".to_string(),
                    SettlementSource::Provider { name } => name.clone(),
                },
            }))
            .actor_opt(actor_id, actor_type);
        BillingEventLogger::log_event_on(&mut *tx, event).await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice.id,
            tenant_id = %invoice.tenant_id,
            subscription_id = %subscription_id,
            actor_type = %actor_type,
            "Invoice settled"
        );

        Ok(SettlementOutcome {
            invoice_id: invoice.id,
            tenant_id: invoice.tenant_id,
            already_paid: false,
            subscription_id: Some(subscription_id),
            subscription_ends_at: ends_at,
        })
    }

    /// Invoices paid without ever going through `pay()` still need a ledger
    async fn ensure_ledger(&self, conn: &mut PgConnection, invoice: &Invoice) -> BillingResult<()> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM invoice_revenue_splits WHERE invoice_id = $1")
                .bind(invoice.id)
                .fetch_one(&mut *conn)
                .await?;

        if count == 0 {
            regenerate_ledger(conn, invoice, self.fee).await?;
        }
        Ok(())
    }

    async fn activate(
        &self,
        conn: &mut PgConnection,
        invoice: &Invoice,
        now: OffsetDateTime,
    ) -> BillingResult<(Uuid, Option<OffsetDateTime>)> {
        let active: Option<Subscription> = sqlx::query_as(
            "SELECT * FROM subscriptions WHERE tenant_id = $1 AND status = 'ACTIVE' FOR UPDATE",
        )
        .bind(invoice.tenant_id)
        .fetch_optional(&mut *conn)
        .await?;

        let linked: Option<Subscription> = match invoice.subscription_id {
            Some(id) if active.as_ref().map(|s| s.id) != Some(id) => {
                sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1 FOR UPDATE")
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?
            }
            _ => None,
        };

        let plan = plan_activation(invoice, active.as_ref(), linked.as_ref(), &self.plans)?;

        let (subscription_id, ends_at, event_type) = match plan {
            ActivationPlan::AlreadyLifetime { subscription_id } => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    tenant_id = %invoice.tenant_id,
                    "Payment received for a tenant that already holds a lifetime subscription"
                );
                (subscription_id, None, BillingEventType::SubscriptionActivated)
            }
            ActivationPlan::GrantLifetime => {
                let canceled = sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = 'CANCELED', updated_at = NOW()
                    WHERE tenant_id = $1 AND status = 'ACTIVE'
                    "#,
                )
                .bind(invoice.tenant_id)
                .execute(&mut *conn)
                .await?;

                let id = insert_subscription(
                    &mut *conn,
                    invoice,
                    SubscriptionType::Lifetime,
                    now,
                    None,
                )
                .await?;

                if canceled.rows_affected() > 0 {
                    let event = BillingEventBuilder::new(
                        invoice.tenant_id,
                        BillingEventType::SubscriptionCanceled,
                    )
                    .invoice(invoice.id)
                    .data(serde_json::json!({
                        "canceled": canceled.rows_affected(),
                        "replaced_by": id,
                    }));
                    BillingEventLogger::log_event_on(&mut *conn, event).await?;

                    tracing::info!(
                        tenant_id = %invoice.tenant_id,
                        canceled = canceled.rows_affected(),
                        "Running subscription replaced by lifetime"
                    );
                }
                (id, None, BillingEventType::LifetimeGranted)
            }
            ActivationPlan::Extend {
                subscription_id,
                subscription_type,
                ends_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = 'ACTIVE', plan_code = $2, subscription_type = $3,
                        ends_at = $4, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(subscription_id)
                .bind(&invoice.plan_code)
                .bind(subscription_type)
                .bind(ends_at)
                .execute(&mut *conn)
                .await?;
                (subscription_id, Some(ends_at), BillingEventType::SubscriptionExtended)
            }
            ActivationPlan::Create {
                subscription_type,
                starts_at,
                ends_at,
            } => {
                let id = insert_subscription(
                    &mut *conn,
                    invoice,
                    subscription_type,
                    starts_at,
                    Some(ends_at),
                )
                .await?;
                (id, Some(ends_at), BillingEventType::SubscriptionActivated)
            }
        };

        if invoice.subscription_id.is_none() {
            sqlx::query("UPDATE invoices SET subscription_id = $2 WHERE id = $1")
                .bind(invoice.id)
                .bind(subscription_id)
                .execute(&mut *conn)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE tenants
            SET status = 'ACTIVE', subscription_ended_at = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice.tenant_id)
        .bind(ends_at)
        .execute(&mut *conn)
        .await?;

        let event = BillingEventBuilder::new(invoice.tenant_id, event_type)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "subscription_id": subscription_id,
                "plan_code": invoice.plan_code,
                "ends_at": ends_at.map(|t| t.unix_timestamp()),
            }));
        BillingEventLogger::log_event_on(&mut *conn, event).await?;

        Ok((subscription_id, ends_at))
    }
}

async fn insert_subscription(
    conn: &mut PgConnection,
    invoice: &Invoice,
    subscription_type: SubscriptionType,
    starts_at: OffsetDateTime,
    ends_at: Option<OffsetDateTime>,
) -> BillingResult<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO subscriptions (tenant_id, plan_code, subscription_type, status, starts_at, ends_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(invoice.tenant_id)
    .bind(&invoice.plan_code)
    .bind(subscription_type)
    .bind(SubscriptionStatus::Active)
    .bind(starts_at)
    .bind(ends_at)
    .fetch_one(conn)
    .await?;

    Ok(id)
}
