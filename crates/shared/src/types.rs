//! Tenant billing data model shared across Kampung

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::KampungError;

// =============================================================================
// Enums
// =============================================================================

/// Position of a tenant in the two-level RW → RT tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantLevel {
    /// Umbrella association (rukun warga), always a root
    Rw,
    /// Neighborhood association (rukun tetangga), child of an RW
    Rt,
}

impl std::fmt::Display for TenantLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rw => write!(f, "RW"),
            Self::Rt => write!(f, "RT"),
        }
    }
}

/// Subscription status of a tenant as seen by the feature gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Demo,
    Trial,
    Active,
    Expired,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demo => "DEMO",
            Self::Trial => "TRIAL",
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEMO" => Ok(Self::Demo),
            "TRIAL" => Ok(Self::Trial),
            "ACTIVE" => Ok(Self::Active),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(format!("Invalid tenant status: {}", s)),
        }
    }
}

/// Whether a tenant is a sandbox or a paying account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantType {
    Demo,
    Live,
}

impl std::fmt::Display for TenantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "DEMO"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

/// Who pays for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR")]
pub enum BillingMode {
    /// Tenant pays its own invoices
    #[sqlx(rename = "SELF")]
    #[serde(rename = "SELF")]
    SelfBilled,
    /// Tenant's invoices are paid by its billing owner (parent RW)
    #[sqlx(rename = "DELEGATED")]
    #[serde(rename = "DELEGATED")]
    Delegated,
}

impl std::fmt::Display for BillingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SelfBilled => write!(f, "SELF"),
            Self::Delegated => write!(f, "DELEGATED"),
        }
    }
}

/// Billing cadence of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionType {
    Monthly,
    Yearly,
    Lifetime,
}

impl SubscriptionType {
    /// End of a service period that starts at `start`.
    /// Returns `None` for lifetime subscriptions, which never end.
    ///
    /// Month arithmetic clamps the day to the last day of the target month
    /// (Jan 31 + 1 month = Feb 28/29, Feb 29 + 1 year = Feb 28).
    pub fn advance(&self, start: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Self::Monthly => Some(add_months(start, 1)),
            Self::Yearly => Some(add_months(start, 12)),
            Self::Lifetime => None,
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "MONTHLY"),
            Self::Yearly => write!(f, "YEARLY"),
            Self::Lifetime => write!(f, "LIFETIME"),
        }
    }
}

impl std::str::FromStr for SubscriptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MONTHLY" => Ok(Self::Monthly),
            "YEARLY" => Ok(Self::Yearly),
            "LIFETIME" => Ok(Self::Lifetime),
            _ => Err(format!("Invalid subscription type: {}", s)),
        }
    }
}

fn add_months(start: OffsetDateTime, months: u32) -> OffsetDateTime {
    let date = start.date();
    let zero_based = date.month() as u32 - 1 + months;
    let year = date.year() + (zero_based / 12) as i32;
    // zero_based % 12 is always in 0..12, so the conversion cannot fail
    let month = Month::try_from((zero_based % 12 + 1) as u8).unwrap_or(Month::December);
    let day = date.day().min(time::util::days_in_year_month(year, month));

    match time::Date::from_calendar_date(year, month, day) {
        Ok(next) => start.replace_date(next),
        Err(_) => start,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Canceled,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Expired => write!(f, "EXPIRED"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceType {
    Subscription,
    Lifetime,
}

impl std::fmt::Display for InvoiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscription => write!(f, "SUBSCRIPTION"),
            Self::Lifetime => write!(f, "LIFETIME"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Unpaid,
    Paid,
    Canceled,
}

impl InvoiceStatus {
    /// Draft and unpaid invoices can still receive a payment instruction
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Draft | Self::Unpaid)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "DRAFT"),
            Self::Unpaid => write!(f, "UNPAID"),
            Self::Paid => write!(f, "PAID"),
            Self::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// How the proceeds of an invoice are settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMode {
    Centralized,
    Split,
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Centralized => write!(f, "CENTRALIZED"),
            Self::Split => write!(f, "SPLIT"),
        }
    }
}

/// Ledger target of a revenue split row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SplitTarget {
    Platform,
    Rw,
}

/// Channel the payer uses to settle an invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentChannel {
    /// Bank transfer reconciled by exact amount
    Manual,
    Qris,
    VirtualAccount,
    Ewallet,
}

impl PaymentChannel {
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Qris => "QRIS",
            Self::VirtualAccount => "VIRTUAL_ACCOUNT",
            Self::Ewallet => "EWALLET",
        }
    }
}

impl std::fmt::Display for PaymentChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MANUAL" => Ok(Self::Manual),
            "QRIS" => Ok(Self::Qris),
            "VIRTUAL_ACCOUNT" | "VA" => Ok(Self::VirtualAccount),
            "EWALLET" | "E_WALLET" => Ok(Self::Ewallet),
            _ => Err(format!("Invalid payment channel: {}", s)),
        }
    }
}

/// User role carried in access tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    /// Platform staff
    PlatformAdmin,
    /// Platform finance operator, confirms manual transfers
    Operator,
    /// Tenant administrator (RT/RW board)
    Admin,
    /// Resident
    Member,
}

impl UserRole {
    /// Roles allowed to mark invoices paid by hand
    pub fn can_confirm_payments(&self) -> bool {
        matches!(self, Self::PlatformAdmin | Self::Operator)
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLATFORM_ADMIN" => Ok(Self::PlatformAdmin),
            "OPERATOR" => Ok(Self::Operator),
            "ADMIN" => Ok(Self::Admin),
            "MEMBER" => Ok(Self::Member),
            _ => Err(format!("Invalid user role: {}", s)),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Tenant (RW or RT association)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub parent_tenant_id: Option<Uuid>,
    pub level: TenantLevel,
    pub status: TenantStatus,
    pub tenant_type: TenantType,
    pub billing_mode: BillingMode,
    pub billing_owner_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_ended_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Tenant {
    /// The tenant that pays this tenant's invoices
    pub fn effective_billing_owner(&self) -> Uuid {
        self.billing_owner_id.unwrap_or(self.id)
    }

    /// Check the tree invariants against the tenant's parent (if any):
    /// RW tenants are roots, RT tenants hang off an RW, and the billing owner is
    /// either the tenant itself or that parent.
    pub fn validate_hierarchy(&self, parent: Option<&Tenant>) -> Result<(), KampungError> {
        match (self.level, self.parent_tenant_id, parent) {
            (TenantLevel::Rw, None, _) => {}
            (TenantLevel::Rw, Some(_), _) => {
                return Err(KampungError::InvalidHierarchy(
                    "RW tenants cannot have a parent".to_string(),
                ))
            }
            (TenantLevel::Rt, Some(parent_id), Some(p)) if p.id == parent_id => {
                if p.level != TenantLevel::Rw {
                    return Err(KampungError::InvalidHierarchy(format!(
                        "RT {} must belong to an RW, found {}",
                        self.id, p.level
                    )));
                }
            }
            (TenantLevel::Rt, Some(parent_id), _) => {
                return Err(KampungError::InvalidHierarchy(format!(
                    "Parent {} of RT {} not supplied",
                    parent_id, self.id
                )))
            }
            (TenantLevel::Rt, None, _) => {}
        }

        match self.billing_owner_id {
            None => Ok(()),
            Some(owner) if owner == self.id => Ok(()),
            Some(owner) if Some(owner) == self.parent_tenant_id => Ok(()),
            Some(owner) => Err(KampungError::InvalidHierarchy(format!(
                "Billing owner {} is neither tenant {} nor its parent",
                owner, self.id
            ))),
        }
    }
}

/// Subscription held by a tenant
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_code: String,
    pub subscription_type: SubscriptionType,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_active_lifetime(&self) -> bool {
        self.status == SubscriptionStatus::Active
            && self.subscription_type == SubscriptionType::Lifetime
    }
}

/// Invoice issued to a tenant (paid by its billing owner)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub tenant_id: Uuid,
    pub billing_owner_id: Uuid,
    pub invoice_type: InvoiceType,
    pub plan_code: String,
    pub subscription_id: Option<Uuid>,
    pub amount: i64,
    pub status: InvoiceStatus,
    pub payment_mode: Option<PaymentMode>,
    pub payment_provider: Option<String>,
    pub payment_channel: Option<PaymentChannel>,
    pub payment_code: Option<String>,
    pub payment_meta: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub payment_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub service_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub service_period_end: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    pub paid_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Invoice {
    pub fn is_self_billed(&self) -> bool {
        self.tenant_id == self.billing_owner_id
    }
}

/// One ledger line recording who should receive part of an invoice
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceRevenueSplit {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub target_type: SplitTarget,
    pub target_tenant_id: Option<Uuid>,
    pub amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
