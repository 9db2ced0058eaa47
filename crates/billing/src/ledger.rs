//! Revenue ledger consistency checks
//!
//! Read-only queries over invoices and their split rows. Each check reports
//! the invoices it flags with enough context to reconcile them by hand.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Serialize)]
pub struct LedgerViolation {
    pub check: &'static str,
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub tenant_id: Uuid,
    pub description: String,
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerReport {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub violations: Vec<LedgerViolation>,
}

impl LedgerReport {
    pub fn is_healthy(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SplitSumRow {
    id: Uuid,
    invoice_number: String,
    tenant_id: Uuid,
    amount: i64,
    split_total: i64,
    split_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnsplitPaidRow {
    id: Uuid,
    invoice_number: String,
    tenant_id: Uuid,
    amount: i64,
    paid_at: Option<OffsetDateTime>,
}

const CHECKS: [&str; 2] = ["split_sum_matches_amount", "paid_invoice_has_splits"];

pub struct LedgerChecker {
    pool: PgPool,
}

impl LedgerChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn available_checks() -> &'static [&'static str] {
        &CHECKS
    }

    pub async fn run_all_checks(&self) -> BillingResult<LedgerReport> {
        let mut violations = self.check_split_sums().await?;
        violations.extend(self.check_paid_invoices_split().await?);

        Ok(LedgerReport {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: CHECKS.len(),
            violations,
        })
    }

    /// Invoices with split rows whose amounts do not add up to the invoice amount
    async fn check_split_sums(&self) -> BillingResult<Vec<LedgerViolation>> {
        let rows: Vec<SplitSumRow> = sqlx::query_as(
            r#"
            SELECT i.id, i.invoice_number, i.tenant_id, i.amount,
                   COALESCE(SUM(s.amount), 0)::BIGINT AS split_total,
                   COUNT(s.id) AS split_count
            FROM invoices i
            JOIN invoice_revenue_splits s ON s.invoice_id = i.id
            GROUP BY i.id
            HAVING COALESCE(SUM(s.amount), 0) <> i.amount
            ORDER BY i.issued_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LedgerViolation {
                check: CHECKS[0],
                invoice_id: row.id,
                invoice_number: row.invoice_number,
                tenant_id: row.tenant_id,
                description: format!(
                    "Splits total {} but invoice amount is {}",
                    row.split_total, row.amount
                ),
                context: serde_json::json!({
                    "amount": row.amount,
                    "split_total": row.split_total,
                    "split_count": row.split_count,
                }),
            })
            .collect())
    }

    async fn check_paid_invoices_split(&self) -> BillingResult<Vec<LedgerViolation>> {
        let rows: Vec<UnsplitPaidRow> = sqlx::query_as(
            r#"
            SELECT i.id, i.invoice_number, i.tenant_id, i.amount, i.paid_at
            FROM invoices i
            WHERE i.status = 'PAID'
              AND NOT EXISTS (SELECT 1 FROM invoice_revenue_splits s WHERE s.invoice_id = i.id)
            ORDER BY i.paid_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LedgerViolation {
                check: CHECKS[1],
                invoice_id: row.id,
                invoice_number: row.invoice_number,
                tenant_id: row.tenant_id,
                description: "Paid invoice has no revenue splits".to_string(),
                context: serde_json::json!({
                    "amount": row.amount,
                    "paid_at": row.paid_at.map(|t| t.unix_timestamp()),
                }),
            })
            .collect())
    }
}
