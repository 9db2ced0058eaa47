//! Revenue ledger verification
//!
//! Reports invoices whose splits do not add up to the invoice amount and paid
//! invoices with no splits. Exits non-zero when anything is found.
//!
//! ## Usage
//! ```bash
//! DATABASE_URL=postgres://... cargo run -p kampung-worker --bin verify-ledger
//! DATABASE_URL=postgres://... cargo run -p kampung-worker --bin verify-ledger -- --json
//! ```

use anyhow::Context;

use kampung_billing::LedgerChecker;
use kampung_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let json = std::env::args().any(|a| a == "--json");

    let pool = db::create_pool(&database_url, 2)
        .await
        .context("Failed to connect to database")?;
    let report = LedgerChecker::new(pool).run_all_checks().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Kampung Ledger Verification");
        println!("===========================\n");
        println!("Checks run: {}", LedgerChecker::available_checks().join(", "));

        if report.is_healthy() {
            println!("All invoice ledgers are consistent");
        } else {
            println!("Found {} problem(s):", report.violations.len());
            for v in &report.violations {
                println!(
                    "  - [{}] {} (invoice {}, tenant {}): {}",
                    v.check, v.invoice_number, v.invoice_id, v.tenant_id, v.description
                );
            }
        }
    }

    if !report.is_healthy() {
        std::process::exit(1);
    }
    Ok(())
}
