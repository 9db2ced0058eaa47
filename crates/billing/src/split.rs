//! Revenue split ledger
//!
//! Records who should receive what for an invoice. Money never moves here.
//! The lines for an invoice always sum to the invoice amount: the platform fee
//! is floored and the RW share is computed by subtraction.

use serde::Serialize;
use sqlx::PgConnection;
use uuid::Uuid;

use kampung_shared::types::{InvoiceRevenueSplit, SplitTarget};

use crate::config::FeeRate;
use crate::error::{BillingError, BillingResult};
use crate::strategy::PaymentStrategy;

/// One ledger line before it is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SplitLine {
    pub target_type: SplitTarget,
    pub target_tenant_id: Option<Uuid>,
    pub amount: i64,
}

impl SplitLine {
    fn platform(amount: i64) -> Self {
        Self {
            target_type: SplitTarget::Platform,
            target_tenant_id: None,
            amount,
        }
    }

    fn rw(tenant_id: Uuid, amount: i64) -> Self {
        Self {
            target_type: SplitTarget::Rw,
            target_tenant_id: Some(tenant_id),
            amount,
        }
    }
}

/// Compute the ledger lines for an invoice.
pub fn calculate_splits(
    strategy: PaymentStrategy,
    tenant_id: Uuid,
    billing_owner_id: Uuid,
    amount: i64,
    fee: FeeRate,
) -> BillingResult<Vec<SplitLine>> {
    if amount < 0 {
        return Err(BillingError::Validation(format!(
            "Invoice amount cannot be negative: {}",
            amount
        )));
    }

    let self_billed = tenant_id == billing_owner_id;

    let lines = match (strategy, self_billed) {
        (_, true) => vec![SplitLine::platform(amount)],
        (PaymentStrategy::Centralized, false) => vec![SplitLine::rw(billing_owner_id, amount)],
        (PaymentStrategy::Split, false) => {
            let platform_fee = fee.platform_share(amount);
            vec![
                SplitLine::platform(platform_fee),
                SplitLine::rw(billing_owner_id, amount - platform_fee),
            ]
        }
    };

    Ok(lines)
}

/// Delete every existing line for the invoice and insert `lines`.
/// Call with the invoice row locked.
pub async fn replace_splits(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    lines: &[SplitLine],
) -> BillingResult<()> {
    sqlx::query("DELETE FROM invoice_revenue_splits WHERE invoice_id = $1")
        .bind(invoice_id)
        .execute(&mut *conn)
        .await?;

    for line in lines {
        sqlx::query(
            r#"
            INSERT INTO invoice_revenue_splits (invoice_id, target_type, target_tenant_id, amount)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(invoice_id)
        .bind(line.target_type)
        .bind(line.target_tenant_id)
        .bind(line.amount)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

pub async fn load_splits(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> BillingResult<Vec<InvoiceRevenueSplit>> {
    let splits = sqlx::query_as::<_, InvoiceRevenueSplit>(
        r#"
        SELECT id, invoice_id, target_type, target_tenant_id, amount, created_at
        FROM invoice_revenue_splits
        WHERE invoice_id = $1
        ORDER BY target_type
        "#,
    )
    .bind(invoice_id)
    .fetch_all(conn)
    .await?;

    Ok(splits)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fee(percent: &str) -> FeeRate {
        FeeRate::parse_percent(percent).unwrap()
    }

    fn total(lines: &[SplitLine]) -> i64 {
        lines.iter().map(|l| l.amount).sum()
    }

    #[test]
    fn test_split_five_percent() {
        let (rt, rw) = (Uuid::new_v4(), Uuid::new_v4());
        let lines = calculate_splits(PaymentStrategy::Split, rt, rw, 150_000, fee("5")).unwrap();

        assert_eq!(
            lines,
            vec![SplitLine::platform(7_500), SplitLine::rw(rw, 142_500)]
        );
    }

    #[test]
    fn test_split_remainder_stays_with_rw() {
        let (rt, rw) = (Uuid::new_v4(), Uuid::new_v4());
        // 2.5% of 99_999 = 2499.975 → platform gets 2499
        let lines = calculate_splits(PaymentStrategy::Split, rt, rw, 99_999, fee("2.5")).unwrap();

        assert_eq!(lines[0].amount, 2_499);
        assert_eq!(lines[1].amount, 97_500);
        assert_eq!(total(&lines), 99_999);
    }

    #[test]
    fn test_sum_always_matches_amount() {
        let (rt, rw) = (Uuid::new_v4(), Uuid::new_v4());
        for percent in ["0", "0.01", "3.33", "5", "12.5", "99.99", "100"] {
            for amount in [0_i64, 1, 7, 999, 50_001, 1_234_567, i64::MAX / 10_000] {
                for strategy in [PaymentStrategy::Split, PaymentStrategy::Centralized] {
                    let lines = calculate_splits(strategy, rt, rw, amount, fee(percent)).unwrap();
                    assert_eq!(total(&lines), amount, "{}% of {}", percent, amount);
                    assert!(lines.iter().all(|l| l.amount >= 0));
                }
            }
        }
    }

    #[test]
    fn test_self_billed_goes_to_platform() {
        let rw = Uuid::new_v4();
        for strategy in [PaymentStrategy::Split, PaymentStrategy::Centralized] {
            let lines = calculate_splits(strategy, rw, rw, 150_000, fee("5")).unwrap();
            assert_eq!(lines, vec![SplitLine::platform(150_000)]);
        }
    }

    #[test]
    fn test_centralized_for_delegated_goes_to_owner() {
        let (rt, rw) = (Uuid::new_v4(), Uuid::new_v4());
        let lines =
            calculate_splits(PaymentStrategy::Centralized, rt, rw, 50_000, fee("5")).unwrap();
        assert_eq!(lines, vec![SplitLine::rw(rw, 50_000)]);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let id = Uuid::new_v4();
        assert!(matches!(
            calculate_splits(PaymentStrategy::Split, id, id, -1, fee("5")),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn test_platform_lines_have_no_tenant() {
        let (rt, rw) = (Uuid::new_v4(), Uuid::new_v4());
        let lines = calculate_splits(PaymentStrategy::Split, rt, rw, 10_000, fee("5")).unwrap();
        for line in lines {
            match line.target_type {
                SplitTarget::Platform => assert!(line.target_tenant_id.is_none()),
                SplitTarget::Rw => assert_eq!(line.target_tenant_id, Some(rw)),
            }
        }
    }
}
