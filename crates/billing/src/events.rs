//! Billing Events Module
//!
//! Append-only billing event log. Every state change the billing core makes
//! (payment instructions, settlements, renewals, status transitions) leaves one
//! row in `billing_events`, which answers "why is this tenant ACTIVE?" without
//! reconstructing it from invoices.
//!
//! Events written as part of a money-moving operation go through
//! [`BillingEventLogger::log_event_on`] so they commit or roll back with it.

use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Invoicing
    InvoiceCreated,
    PaymentInstructionIssued,
    InvoicePaid,

    // Subscription lifecycle
    SubscriptionActivated,
    SubscriptionExtended,
    SubscriptionLapsed,
    SubscriptionCanceled,
    LifetimeGranted,

    // Renewal
    RenewalInvoiceCreated,

    // Tenant
    TenantStatusChanged,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::InvoiceCreated => "INVOICE_CREATED",
            BillingEventType::PaymentInstructionIssued => "PAYMENT_INSTRUCTION_ISSUED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::SubscriptionExtended => "SUBSCRIPTION_EXTENDED",
            BillingEventType::SubscriptionLapsed => "SUBSCRIPTION_LAPSED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::LifetimeGranted => "LIFETIME_GRANTED",
            BillingEventType::RenewalInvoiceCreated => "RENEWAL_INVOICE_CREATED",
            BillingEventType::TenantStatusChanged => "TENANT_STATUS_CHANGED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Tenant user through the API
    User,
    /// Platform operator confirming a transfer
    Operator,
    /// Scheduler or request-time resolution
    System,
    /// Payment engine callback
    PaymentEngine,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Operator => write!(f, "operator"),
            ActorType::System => write!(f, "system"),
            ActorType::PaymentEngine => write!(f, "payment_engine"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub invoice_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    tenant_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    invoice_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(tenant_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            tenant_id,
            event_type,
            event_data: serde_json::json!({}),
            invoice_id: None,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn invoice(mut self, invoice_id: Uuid) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        self.actor_id = actor_id;
        self.actor_type = actor_type;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log an event outside any transaction
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let mut conn = self.pool.acquire().await?;
        Self::log_event_on(&mut *conn, builder).await
    }

    /// Log an event on an open connection or transaction
    pub async fn log_event_on(
        conn: &mut PgConnection,
        builder: BillingEventBuilder,
    ) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                tenant_id,
                event_type,
                event_data,
                invoice_id,
                actor_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(builder.tenant_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(builder.invoice_id)
        .bind(builder.actor_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(conn)
        .await?;

        Ok(event_id.0)
    }

    /// Recent events for a tenant, newest first
    pub async fn get_events_for_tenant(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, event_type, event_data, invoice_id, actor_id, actor_type, created_at
            FROM billing_events
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Events attached to one invoice, oldest first
    pub async fn get_events_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, event_type, event_data, invoice_id, actor_id, actor_type, created_at
            FROM billing_events
            WHERE invoice_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_event_type_display() {
        assert_eq!(BillingEventType::InvoicePaid.to_string(), "INVOICE_PAID");
        assert_eq!(
            BillingEventType::TenantStatusChanged.to_string(),
            "TENANT_STATUS_CHANGED"
        );
        assert_eq!(
            BillingEventType::RenewalInvoiceCreated.to_string(),
            "RENEWAL_INVOICE_CREATED"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::Operator.to_string(), "operator");
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::PaymentEngine.to_string(), "payment_engine");
    }

    #[test]
    fn test_event_builder() {
        let tenant_id = Uuid::new_v4();
        let invoice_id = Uuid::new_v4();
        let operator = Uuid::new_v4();
        let builder = BillingEventBuilder::new(tenant_id, BillingEventType::InvoicePaid)
            .data(serde_json::json!({"channel": "MANUAL"}))
            .invoice(invoice_id)
            .actor(operator, ActorType::Operator);

        assert_eq!(builder.tenant_id, tenant_id);
        assert_eq!(builder.event_type, BillingEventType::InvoicePaid);
        assert_eq!(builder.invoice_id, Some(invoice_id));
        assert_eq!(builder.actor_id, Some(operator));
        assert_eq!(builder.actor_type, ActorType::Operator);
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let builder = BillingEventBuilder::new(Uuid::new_v4(), BillingEventType::SubscriptionLapsed);
        assert_eq!(builder.actor_type, ActorType::System);
        assert!(builder.actor_id.is_none());
        assert_eq!(builder.event_data, serde_json::json!({}));
    }
}
