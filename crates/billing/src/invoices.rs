//! Invoice persistence
//!
//! Row-level helpers shared by subscribe, payment, activation and renewal. They
//! take a connection so callers decide the transaction boundary.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use kampung_shared::types::{Invoice, InvoiceRevenueSplit, InvoiceType};

use crate::error::{BillingError, BillingResult};
use crate::instruction::PaymentInstruction;
use crate::split;

/// `INV/{YYYYMMDD}/{seq:06}`; the sequence keeps numbers unique across days
pub fn format_invoice_number(issued_at: OffsetDateTime, seq: i64) -> String {
    let date = issued_at.date();
    format!(
        "INV/{:04}{:02}{:02}/{:06}",
        date.year(),
        u8::from(date.month()),
        date.day(),
        seq
    )
}

pub async fn next_invoice_number(
    conn: &mut PgConnection,
    issued_at: OffsetDateTime,
) -> BillingResult<String> {
    let (seq,): (i64,) = sqlx::query_as("SELECT nextval('invoice_number_seq')")
        .fetch_one(conn)
        .await?;
    Ok(format_invoice_number(issued_at, seq))
}

/// Invoice about to be issued
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub tenant_id: Uuid,
    pub billing_owner_id: Uuid,
    pub invoice_type: InvoiceType,
    pub plan_code: String,
    pub subscription_id: Option<Uuid>,
    pub amount: i64,
    pub service_period_start: OffsetDateTime,
    pub service_period_end: Option<OffsetDateTime>,
}

/// Insert an UNPAID invoice. Returns `None` when an open invoice for the same
/// subscription period already exists.
pub async fn insert_unpaid(
    conn: &mut PgConnection,
    new: &NewInvoice,
    issued_at: OffsetDateTime,
) -> BillingResult<Option<Invoice>> {
    if new.amount < 0 {
        return Err(BillingError::Validation(format!(
            "Invoice amount cannot be negative: {}",
            new.amount
        )));
    }

    let invoice_number = next_invoice_number(&mut *conn, issued_at).await?;

    let invoice = sqlx::query_as::<_, Invoice>(
        r#"
        INSERT INTO invoices (
            invoice_number, tenant_id, billing_owner_id, invoice_type, plan_code,
            subscription_id, amount, status, service_period_start, service_period_end, issued_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'UNPAID', $8, $9, $10)
        ON CONFLICT DO NOTHING
        RETURNING *
        "#,
    )
    .bind(&invoice_number)
    .bind(new.tenant_id)
    .bind(new.billing_owner_id)
    .bind(new.invoice_type)
    .bind(&new.plan_code)
    .bind(new.subscription_id)
    .bind(new.amount)
    .bind(new.service_period_start)
    .bind(new.service_period_end)
    .bind(issued_at)
    .fetch_optional(conn)
    .await?;

    Ok(invoice)
}

/// Lock an invoice row for the rest of the transaction
pub async fn lock_invoice(conn: &mut PgConnection, invoice_id: Uuid) -> BillingResult<Invoice> {
    sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = $1 FOR UPDATE")
        .bind(invoice_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))
}

/// Open (UNPAID or DRAFT) invoice of a tenant for a plan, newest first
pub async fn find_open_for_plan(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    plan_code: &str,
) -> BillingResult<Option<Invoice>> {
    let invoice = sqlx::query_as::<_, Invoice>(
        r#"
        SELECT * FROM invoices
        WHERE tenant_id = $1 AND plan_code = $2 AND status IN ('UNPAID', 'DRAFT')
        ORDER BY issued_at DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .bind(plan_code)
    .fetch_optional(conn)
    .await?;

    Ok(invoice)
}

/// Invoice with its ledger and current instruction
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceView {
    pub invoice: Invoice,
    pub splits: Vec<InvoiceRevenueSplit>,
    pub instruction: Option<PaymentInstruction>,
}

/// Read side of invoices
pub struct InvoiceService {
    pool: PgPool,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))
    }

    /// Latest invoice of a tenant with splits and the persisted instruction
    pub async fn current_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Option<InvoiceView>> {
        let mut conn = self.pool.acquire().await?;

        let Some(invoice) = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT * FROM invoices
            WHERE tenant_id = $1
            ORDER BY issued_at DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await?
        else {
            return Ok(None);
        };

        let splits = split::load_splits(&mut *conn, invoice.id).await?;
        let instruction = PaymentInstruction::from_invoice(&invoice)?;

        Ok(Some(InvoiceView {
            invoice,
            splits,
            instruction,
        }))
    }
}
