//! Payment engine webhooks
//!
//! Notifications arrive as JSON signed with HMAC-SHA256:
//!
//! ```text
//! X-Kampung-Signature: t=<unix seconds>,v1=<hex hmac_sha256(secret, "<t>.<body>")>
//! ```
//!
//! Signatures older than five minutes are rejected. The notification's
//! `reference` is the `IURAN-{invoice_id}` sent when the payment was created.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::activation::{ActivationService, SettlementOutcome};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::instruction::parse_payment_reference;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Kampung-Signature";

const TOLERANCE_SECS: i64 = 300;

fn mac_for(secret: &str, timestamp: i64, body: &[u8]) -> BillingResult<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

/// Header value for `body` signed at `timestamp`
pub fn sign(secret: &str, timestamp: i64, body: &[u8]) -> BillingResult<String> {
    let mac = mac_for(secret, timestamp, body)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1: Option<&str> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1 = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    let provided = v1
        .and_then(|sig| hex::decode(sig).ok())
        .ok_or_else(|| {
            tracing::warn!("Missing or malformed v1 signature in webhook header");
            BillingError::WebhookSignatureInvalid
        })?;

    let drift = (now.unix_timestamp() - timestamp).abs();
    if drift > TOLERANCE_SECS {
        tracing::warn!(timestamp = timestamp, drift = drift, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = mac_for(secret, timestamp, body)?.finalize().into_bytes();
    if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Body of a payment notification
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    pub reference: String,
    pub status: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl PaymentNotification {
    pub fn is_settled(&self) -> bool {
        matches!(self.status.to_ascii_uppercase().as_str(), "PAID" | "SETTLED")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Settled(SettlementOutcome),
    Ignored { invoice_id: Uuid, status: String },
}

/// Verifies and applies payment engine notifications
pub struct WebhookService {
    provider_name: String,
    secret: String,
    activation: ActivationService,
}

impl WebhookService {
    pub fn new(pool: PgPool, config: &BillingConfig) -> Self {
        Self {
            provider_name: config.payment_engine.provider_name.clone(),
            secret: config.payment_engine.webhook_secret.clone(),
            activation: ActivationService::new(pool, config),
        }
    }

    pub async fn handle_payment(
        &self,
        provider: &str,
        signature: Option<&str>,
        body: &[u8],
    ) -> BillingResult<WebhookOutcome> {
        if provider != self.provider_name {
            return Err(BillingError::NotFound(format!("Unknown payment provider: {}", provider)));
        }
        if self.secret.is_empty() {
            return Err(BillingError::Config(
                "PAYMENT_WEBHOOK_SECRET is not configured".to_string(),
            ));
        }

        let signature = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
        verify_signature(&self.secret, signature, body, OffsetDateTime::now_utc())?;

        let notification: PaymentNotification = serde_json::from_slice(body)
            .map_err(|e| BillingError::Validation(format!("Malformed notification: {}", e)))?;
        let invoice_id = parse_payment_reference(&notification.reference).ok_or_else(|| {
            BillingError::Validation(format!("Unknown payment reference: {}", notification.reference))
        })?;

        if !notification.is_settled() {
            tracing::info!(
                invoice_id = %invoice_id,
                provider = %provider,
                status = %notification.status,
                "Payment notification acknowledged without settlement"
            );
            return Ok(WebhookOutcome::Ignored {
                invoice_id,
                status: notification.status,
            });
        }

        tracing::info!(
            invoice_id = %invoice_id,
            provider = %provider,
            transaction_id = ?notification.transaction_id,
            "Settling invoice from payment notification"
        );
        let outcome = self.activation.settle_from_provider(invoice_id, provider).await?;
        Ok(WebhookOutcome::Settled(outcome))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_kampung_test";
    const BODY: &[u8] = br#"{"reference":"IURAN-5f0c6f2e-3b8a-4a51-9a0e-0d6f1f9a1b23","status":"PAID"}"#;

    #[test]
    fn test_valid_signature_accepted() {
        let now = OffsetDateTime::now_utc();
        let header = sign(SECRET, now.unix_timestamp(), BODY).unwrap();
        assert!(verify_signature(SECRET, &header, BODY, now).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign("other_secret", now.unix_timestamp(), BODY).unwrap();
        assert!(matches!(
            verify_signature(SECRET, &header, BODY, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign(SECRET, now.unix_timestamp(), BODY).unwrap();
        let tampered = br#"{"reference":"IURAN-5f0c6f2e-3b8a-4a51-9a0e-0d6f1f9a1b23","status":"SETTLED"}"#;
        assert!(verify_signature(SECRET, &header, tampered, now).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = OffsetDateTime::now_utc();
        let header = sign(SECRET, now.unix_timestamp() - 301, BODY).unwrap();
        assert!(verify_signature(SECRET, &header, BODY, now).is_err());

        let header = sign(SECRET, now.unix_timestamp() - 299, BODY).unwrap();
        assert!(verify_signature(SECRET, &header, BODY, now).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let now = OffsetDateTime::now_utc();
        for header in ["", "v1=abcd", "t=123", "t=abc,v1=abcd", "t=1,v1=not-hex"] {
            assert!(
                verify_signature(SECRET, header, BODY, now).is_err(),
                "{:?}",
                header
            );
        }
    }

    #[test]
    fn test_notification_status() {
        let paid: PaymentNotification = serde_json::from_slice(BODY).unwrap();
        assert!(paid.is_settled());
        assert_eq!(
            parse_payment_reference(&paid.reference),
            Some(Uuid::parse_str("5f0c6f2e-3b8a-4a51-9a0e-0d6f1f9a1b23").unwrap())
        );

        let pending: PaymentNotification =
            serde_json::from_str(r#"{"reference":"IURAN-x","status":"pending"}"#).unwrap();
        assert!(!pending.is_settled());
    }
}
