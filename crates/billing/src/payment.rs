//! Paying an invoice
//!
//! `pay()` is an exclusive section per invoice: the row is locked with
//! `SELECT ... FOR UPDATE`, then strategy resolution, split regeneration and
//! instruction persistence happen in one transaction. Calling it again replaces
//! the previous split set and instruction.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use kampung_shared::types::{Invoice, InvoiceStatus, PaymentChannel, PaymentMode, TenantStatus};

use crate::config::{BillingConfig, FeeRate};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::instruction::{self, InstructionGenerator, PaymentInstruction};
use crate::invoices;
use crate::split::{self, SplitLine};
use crate::strategy::{resolve_strategy, PaymentContext, PaymentStrategy};

/// Who is paying
#[derive(Debug, Clone, Copy)]
pub struct Payer {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub payment_mode: PaymentMode,
    pub provider: String,
    pub instruction: PaymentInstruction,
    pub splits: Vec<SplitLine>,
}

/// Load the tenant and billing owner status for an invoice
pub(crate) async fn load_payment_context(
    conn: &mut PgConnection,
    invoice: &Invoice,
) -> BillingResult<PaymentContext> {
    let row: Option<(TenantStatus, Option<TenantStatus>)> = sqlx::query_as(
        r#"
        SELECT t.status, o.status
        FROM tenants t
        LEFT JOIN tenants o ON o.id = $2 AND o.deleted_at IS NULL
        WHERE t.id = $1
        "#,
    )
    .bind(invoice.tenant_id)
    .bind(invoice.billing_owner_id)
    .fetch_optional(conn)
    .await?;

    let (tenant_status, owner_status) = row.ok_or_else(|| {
        BillingError::NotFound(format!(
            "Tenant {} of invoice {} not found",
            invoice.tenant_id, invoice.invoice_number
        ))
    })?;

    if owner_status.is_none() {
        tracing::warn!(
            invoice_id = %invoice.id,
            billing_owner_id = %invoice.billing_owner_id,
            "Data integrity: billing owner of invoice missing"
        );
    }

    Ok(PaymentContext {
        tenant_id: invoice.tenant_id,
        tenant_status,
        invoice_type: invoice.invoice_type,
        billing_owner_id: invoice.billing_owner_id,
        owner_status,
    })
}

/// Resolve the strategy and rewrite the split ledger of a locked invoice
pub(crate) async fn regenerate_ledger(
    conn: &mut PgConnection,
    invoice: &Invoice,
    fee: FeeRate,
) -> BillingResult<(PaymentStrategy, Vec<SplitLine>)> {
    let ctx = load_payment_context(&mut *conn, invoice).await?;
    let strategy = resolve_strategy(&ctx)?;
    let lines = split::calculate_splits(
        strategy,
        invoice.tenant_id,
        invoice.billing_owner_id,
        invoice.amount,
        fee,
    )?;

    split::replace_splits(&mut *conn, invoice.id, &lines).await?;

    sqlx::query("UPDATE invoices SET payment_mode = $2, updated_at = NOW() WHERE id = $1")
        .bind(invoice.id)
        .bind(strategy.mode())
        .execute(&mut *conn)
        .await?;

    Ok((strategy, lines))
}

/// Payment service
pub struct PaymentService {
    pool: PgPool,
    fee: FeeRate,
    generator: InstructionGenerator,
}

impl PaymentService {
    pub fn new(pool: PgPool, config: &BillingConfig) -> BillingResult<Self> {
        Ok(Self {
            pool,
            fee: config.platform_fee,
            generator: InstructionGenerator::new(config)?,
        })
    }

    /// Resolve the strategy, regenerate splits and issue a payment instruction.
    pub async fn pay(
        &self,
        invoice_id: Uuid,
        channel: PaymentChannel,
        payer: Payer,
    ) -> BillingResult<PaymentOutcome> {
        let mut tx = self.pool.begin().await?;

        let invoice = invoices::lock_invoice(&mut *tx, invoice_id).await?;

        if payer.tenant_id != invoice.tenant_id && payer.tenant_id != invoice.billing_owner_id {
            return Err(BillingError::PermissionDenied(format!(
                "Invoice {} does not belong to tenant {}",
                invoice.invoice_number, payer.tenant_id
            )));
        }
        instruction::ensure_payable(&invoice)?;

        let (strategy, splits) = regenerate_ledger(&mut *tx, &invoice, self.fee).await?;

        let now = OffsetDateTime::now_utc();
        let instruction = self.generator.generate(&invoice, channel, now).await?;
        instruction::persist_instruction(&mut *tx, invoice.id, &instruction).await?;

        let event = BillingEventBuilder::new(invoice.tenant_id, BillingEventType::PaymentInstructionIssued)
            .invoice(invoice.id)
            .data(serde_json::json!({
                "channel": channel,
                "payment_mode": strategy.mode(),
                "provider": instruction.provider,
                "pending": instruction.is_pending(),
                "splits": splits,
            }))
            .actor(payer.user_id, ActorType::User);
        BillingEventLogger::log_event_on(&mut *tx, event).await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice.id,
            tenant_id = %invoice.tenant_id,
            channel = %channel,
            payment_mode = %strategy.mode(),
            pending = instruction.is_pending(),
            "Payment instruction issued"
        );

        Ok(PaymentOutcome {
            invoice_id: invoice.id,
            status: InvoiceStatus::Unpaid,
            payment_mode: strategy.mode(),
            provider: instruction.provider.clone(),
            instruction,
            splits,
        })
    }
}
