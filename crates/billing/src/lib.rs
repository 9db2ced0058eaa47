#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Kampung Tenant Billing
//!
//! Subscription status and payments for the RW → RT tenant tree.
//!
//! ## Features
//!
//! - **Status Resolution**: Per-request tenant status with lifetime override, own expiry
//!   and inheritance from the billing owner
//! - **Payment Strategy**: Centralized or split collection per invoice
//! - **Revenue Splits**: Exact platform/RW ledger lines for every payment
//! - **Payment Instructions**: Manual bank transfer codes and payment engine redirects
//! - **Renewals**: Daily batch issuing the next period's invoice
//! - **Feature Gate**: Read-only demo, expired write block, trial feature locks
//! - **Webhooks**: Signed settlement notifications from the payment engine

pub mod activation;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod instruction;
pub mod invoices;
pub mod ledger;
pub mod payment;
pub mod renewal;
pub mod split;
pub mod status;
pub mod strategy;
pub mod subscribe;
pub mod webhook;

// Activation
pub use activation::{
    plan_activation, ActivationPlan, ActivationService, SettlementOutcome, SettlementSource,
};

// Config
pub use config::{
    BillingConfig, FeeRate, ManualTransferConfig, PaymentEngineConfig, PlanCatalog, PlanPrice,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Gate
pub use gate::{evaluate, GateDecision, RouteCategory, RouteIdentity};

// Instruction
pub use instruction::{
    InstructionGenerator, PaymentEngineClient, PaymentInstruction, PaymentMeta,
};

// Invoices
pub use invoices::{InvoiceService, InvoiceView};

// Ledger
pub use ledger::{LedgerChecker, LedgerReport, LedgerViolation};

// Payment
pub use payment::{Payer, PaymentOutcome, PaymentService};

// Renewal
pub use renewal::{plan_renewal, RenewalDecision, RenewalFailure, RenewalReport, RenewalService};

// Split
pub use split::{calculate_splits, SplitLine};

// Status
pub use status::{resolve_status, ResolvedTenant, StatusResolution, StatusService};

// Strategy
pub use strategy::{resolve_strategy, PaymentContext, PaymentStrategy};

// Subscribe
pub use subscribe::{SubscribeOutcome, SubscribeService};

// Webhook
pub use webhook::{WebhookOutcome, WebhookService, SIGNATURE_HEADER};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub activation: ActivationService,
    pub events: BillingEventLogger,
    pub invoices: InvoiceService,
    pub ledger: LedgerChecker,
    pub payments: PaymentService,
    pub renewal: RenewalService,
    pub status: StatusService,
    pub subscribe: SubscribeService,
    pub webhooks: WebhookService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::new(pool, &config)
    }

    /// Create a new billing service with explicit config
    pub fn new(pool: PgPool, config: &BillingConfig) -> BillingResult<Self> {
        Ok(Self {
            activation: ActivationService::new(pool.clone(), config),
            events: BillingEventLogger::new(pool.clone()),
            invoices: InvoiceService::new(pool.clone()),
            ledger: LedgerChecker::new(pool.clone()),
            payments: PaymentService::new(pool.clone(), config)?,
            renewal: RenewalService::new(pool.clone(), config),
            status: StatusService::new(pool.clone()),
            subscribe: SubscribeService::new(pool.clone(), config),
            webhooks: WebhookService::new(pool, config),
        })
    }
}
