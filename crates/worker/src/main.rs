//! Kampung billing worker
//!
//! Runs the daily billing cycle (subscription lapse sweep and renewal invoices) on
//! `RENEWAL_CRON` (default 01:00 UTC), or once with `--once`.

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};

use kampung_billing::{BillingConfig, RenewalService};
use kampung_shared::{db, telemetry};

use jobs::RunMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing("kampung_worker=info,kampung_billing=info");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let max_connections: u32 = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);

    let config = BillingConfig::from_env().context("Invalid billing configuration")?;
    let pool = db::create_pool(&database_url, max_connections)
        .await
        .context("Failed to connect to database")?;
    let renewal = Arc::new(RenewalService::new(pool, &config));

    match RunMode::from_args(std::env::args(), std::env::var("RENEWAL_CRON").ok()) {
        RunMode::Once => {
            let summary = jobs::run_billing_cycle(&renewal, OffsetDateTime::now_utc()).await?;
            tracing::info!(
                lapsed = summary.lapsed,
                created = summary.renewal.created,
                failed = summary.renewal.failures.len(),
                "Single billing cycle complete"
            );
            println!("{}", serde_json::to_string_pretty(&summary.renewal)?);
        }
        RunMode::Scheduled { cron } => {
            let scheduler = JobScheduler::new().await?;

            let job_renewal = renewal.clone();
            let job = Job::new_async(cron.as_str(), move |_id, _scheduler| {
                let renewal = job_renewal.clone();
                Box::pin(async move { jobs::scheduled_cycle(renewal).await })
            })
            .with_context(|| format!("Invalid RENEWAL_CRON expression: {}", cron))?;

            scheduler.add(job).await?;
            scheduler.start().await?;
            tracing::info!(cron = %cron, "Billing worker scheduled");

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down billing worker");
        }
    }

    Ok(())
}
