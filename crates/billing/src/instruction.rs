//! Payment instructions
//!
//! Turns an open invoice plus a payment channel into something the payer can act
//! on, and persists it on the invoice so `GET /invoices/current` shows the same
//! instruction until `pay()` runs again.
//!
//! - **MANUAL**: bank transfer of `amount + code`, where `code` is a random
//!   1..=999 disambiguator used to reconcile incoming transfers. Valid 24 hours.
//! - **QRIS / VIRTUAL_ACCOUNT / EWALLET**: the payment engine is asked for a
//!   checkout URL. Any failure degrades to an instruction without a redirect,
//!   which the payer retries later.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use time::OffsetDateTime;
use uuid::Uuid;

use kampung_shared::types::{Invoice, InvoiceStatus, PaymentChannel};

use crate::config::{BillingConfig, ManualTransferConfig, PaymentEngineConfig};
use crate::error::{BillingError, BillingResult};

/// Provider recorded on invoices settled by bank transfer
pub const MANUAL_PROVIDER: &str = "manual";

/// Prefix of the reference sent to the payment engine
pub const REFERENCE_PREFIX: &str = "IURAN-";

const MANUAL_CODE_RANGE: std::ops::RangeInclusive<i64> = 1..=999;

pub fn payment_reference(invoice_id: Uuid) -> String {
    format!("{}{}", REFERENCE_PREFIX, invoice_id)
}

/// Inverse of [`payment_reference`]
pub fn parse_payment_reference(reference: &str) -> Option<Uuid> {
    reference
        .strip_prefix(REFERENCE_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualMeta {
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalMeta {
    pub redirect_url: Option<String>,
}

/// Persisted `payment_meta`. Either shape may be stored on an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PaymentMeta {
    Manual(ManualMeta),
    Digital(DigitalMeta),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentInstruction {
    pub channel: PaymentChannel,
    pub provider: String,
    pub payment_code: String,
    pub amount: i64,
    /// What the payer must send; differs from `amount` only for manual transfers
    pub amount_total: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub meta: PaymentMeta,
}

impl PaymentInstruction {
    /// Digital instruction whose checkout URL could not be obtained
    pub fn is_pending(&self) -> bool {
        matches!(&self.meta, PaymentMeta::Digital(DigitalMeta { redirect_url: None }))
    }

    /// Rebuild the instruction persisted on an invoice, if any
    pub fn from_invoice(invoice: &Invoice) -> BillingResult<Option<Self>> {
        let (Some(channel), Some(payment_code), Some(raw_meta)) = (
            invoice.payment_channel,
            invoice.payment_code.as_ref(),
            invoice.payment_meta.as_ref(),
        ) else {
            return Ok(None);
        };

        let meta: PaymentMeta = serde_json::from_value(raw_meta.clone())?;
        let amount_total = if channel.is_manual() {
            let code: i64 = payment_code.parse().map_err(|_| {
                BillingError::Internal(format!(
                    "Invoice {} has a malformed manual payment code",
                    invoice.id
                ))
            })?;
            invoice.amount + code
        } else {
            invoice.amount
        };

        Ok(Some(Self {
            channel,
            provider: invoice
                .payment_provider
                .clone()
                .unwrap_or_else(|| MANUAL_PROVIDER.to_string()),
            payment_code: payment_code.clone(),
            amount: invoice.amount,
            amount_total,
            expires_at: invoice.payment_expires_at,
            meta,
        }))
    }
}

/// Paid and canceled invoices cannot receive a new instruction.
pub fn ensure_payable(invoice: &Invoice) -> BillingResult<()> {
    match invoice.status {
        status if status.is_open() => Ok(()),
        InvoiceStatus::Paid => Err(BillingError::StateConflict(format!(
            "Invoice {} is already paid",
            invoice.invoice_number
        ))),
        _ => Err(BillingError::StateConflict(format!(
            "Invoice {} is canceled",
            invoice.invoice_number
        ))),
    }
}

/// Manual transfer instruction with an explicit disambiguation code
pub fn manual_instruction(
    invoice: &Invoice,
    bank: &ManualTransferConfig,
    code: i64,
    now: OffsetDateTime,
) -> PaymentInstruction {
    let amount_total = invoice.amount + code;

    PaymentInstruction {
        channel: PaymentChannel::Manual,
        provider: MANUAL_PROVIDER.to_string(),
        payment_code: code.to_string(),
        amount: invoice.amount,
        amount_total,
        expires_at: Some(now + time::Duration::hours(24)),
        meta: PaymentMeta::Manual(ManualMeta {
            bank_name: bank.bank_name.clone(),
            account_number: bank.account_number.clone(),
            account_holder: bank.account_holder.clone(),
            description: format!(
                "Transfer exactly {} for invoice {} (includes unique code {})",
                amount_total, invoice.invoice_number, code
            ),
        }),
    }
}

#[derive(Debug, Serialize)]
struct CreatePaymentRequest<'a> {
    reference: &'a str,
    amount: i64,
    channel: PaymentChannel,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentResponse {
    redirect_url: String,
}

/// HTTP client for the external payment engine
#[derive(Clone)]
pub struct PaymentEngineClient {
    http: reqwest::Client,
    base_url: String,
    provider_name: String,
    timeout: Duration,
}

impl PaymentEngineClient {
    pub fn new(config: &PaymentEngineConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            provider_name: config.provider_name.clone(),
            timeout: config.timeout,
        })
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Ask the engine for a checkout URL. Bounded by the configured timeout.
    pub async fn create_payment(
        &self,
        reference: &str,
        amount: i64,
        channel: PaymentChannel,
    ) -> BillingResult<String> {
        let url = format!("{}/payments", self.base_url);
        let body = CreatePaymentRequest {
            reference,
            amount,
            channel,
        };

        let call = async {
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| BillingError::UpstreamUnavailable(e.to_string()))?;

            if !response.status().is_success() {
                return Err(BillingError::UpstreamUnavailable(format!(
                    "Payment engine returned {}",
                    response.status()
                )));
            }

            let parsed: CreatePaymentResponse = response
                .json()
                .await
                .map_err(|e| BillingError::UpstreamUnavailable(format!("Bad response: {}", e)))?;
            Ok(parsed.redirect_url)
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                BillingError::UpstreamUnavailable(format!(
                    "Payment engine did not answer within {:?}",
                    self.timeout
                ))
            })?
    }
}

/// Generates instructions for every channel
#[derive(Clone)]
pub struct InstructionGenerator {
    engine: PaymentEngineClient,
    manual: ManualTransferConfig,
}

impl InstructionGenerator {
    pub fn new(config: &BillingConfig) -> BillingResult<Self> {
        Ok(Self {
            engine: PaymentEngineClient::new(&config.payment_engine)?,
            manual: config.manual_transfer.clone(),
        })
    }

    pub async fn generate(
        &self,
        invoice: &Invoice,
        channel: PaymentChannel,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentInstruction> {
        ensure_payable(invoice)?;

        if channel.is_manual() {
            let code = rand::thread_rng().gen_range(MANUAL_CODE_RANGE);
            return Ok(manual_instruction(invoice, &self.manual, code, now));
        }

        let reference = payment_reference(invoice.id);
        let redirect_url = match self
            .engine
            .create_payment(&reference, invoice.amount, channel)
            .await
        {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    channel = %channel,
                    error = %e,
                    "Payment engine unavailable, issuing instruction without redirect"
                );
                None
            }
        };

        Ok(PaymentInstruction {
            channel,
            provider: self.engine.provider_name().to_string(),
            payment_code: reference,
            amount: invoice.amount,
            amount_total: invoice.amount,
            expires_at: None,
            meta: PaymentMeta::Digital(DigitalMeta { redirect_url }),
        })
    }
}

/// Store the instruction on the invoice and move a draft to UNPAID
pub async fn persist_instruction(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    instruction: &PaymentInstruction,
) -> BillingResult<()> {
    let meta = serde_json::to_value(&instruction.meta)?;

    sqlx::query(
        r#"
        UPDATE invoices
        SET payment_channel = $2,
            payment_provider = $3,
            payment_code = $4,
            payment_meta = $5,
            payment_expires_at = $6,
            status = 'UNPAID',
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(invoice_id)
    .bind(instruction.channel)
    .bind(&instruction.provider)
    .bind(&instruction.payment_code)
    .bind(meta)
    .bind(instruction.expires_at)
    .execute(conn)
    .await?;

    Ok(())
}
