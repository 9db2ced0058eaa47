//! Scheduled billing jobs

use std::sync::Arc;

use time::OffsetDateTime;

use kampung_billing::{BillingResult, RenewalReport, RenewalService};

pub const DEFAULT_RENEWAL_CRON: &str = "0 0 1 * * *";

/// How the worker was asked to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Single pass, then exit
    Once,
    /// Stay up and run on the cron schedule
    Scheduled { cron: String },
}

impl RunMode {
    pub fn from_args<I>(args: I, cron: Option<String>) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        if args.into_iter().any(|a| a == "--once") {
            Self::Once
        } else {
            Self::Scheduled {
                cron: cron
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_RENEWAL_CRON.to_string()),
            }
        }
    }
}

#[derive(Debug)]
pub struct CycleSummary {
    pub lapsed: u64,
    pub renewal: RenewalReport,
}

/// Daily billing cycle: lapse overdue subscriptions, then issue renewal invoices
pub async fn run_billing_cycle(
    renewal: &RenewalService,
    now: OffsetDateTime,
) -> BillingResult<CycleSummary> {
    let lapsed = renewal.expire_lapsed_subscriptions(now).await?;
    let report = renewal.run_renewal_pass(now).await?;

    for failure in &report.failures {
        tracing::warn!(
            subscription_id = %failure.subscription_id,
            tenant_id = %failure.tenant_id,
            error = %failure.error,
            "Renewal needs attention"
        );
    }

    Ok(CycleSummary {
        lapsed,
        renewal: report,
    })
}

/// Cron entry point; errors are logged, the scheduler keeps running
pub async fn scheduled_cycle(renewal: Arc<RenewalService>) {
    let started = std::time::Instant::now();
    match run_billing_cycle(&renewal, OffsetDateTime::now_utc()).await {
        Ok(summary) => tracing::info!(
            lapsed = summary.lapsed,
            examined = summary.renewal.examined,
            created = summary.renewal.created,
            failed = summary.renewal.failures.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Billing cycle finished"
        ),
        Err(e) => tracing::error!(error = %e, "Billing cycle failed"),
    }
}
