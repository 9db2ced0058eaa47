//! Tenant Status Resolution
//!
//! Computes the effective subscription status of a tenant on every tenant-scoped
//! request and persists it only when it changed.
//!
//! ## Evaluation order
//!
//! 1. **Lifetime override**: an ACTIVE lifetime subscription forces ACTIVE.
//! 2. **Own expiry**: a trial past `trial_end_at` expires; an ACTIVE tenant past
//!    `subscription_ended_at` expires, unless billing is delegated to an owner.
//! 3. **Owner inheritance**: a delegated tenant without its own running
//!    subscription or trial takes the owner's effective status (ACTIVE, EXPIRED or
//!    TRIAL). An owner in DEMO never propagates. A running trial is judged by the
//!    tenant's own `trial_end_at`, never by its stored status, so an inherited TRIAL
//!    ends with the owner's.
//!
//! Resolution never fails. A missing owner is logged as a data-integrity warning
//! and the tenant falls back to its own expiry outcome. A failure loading the tenant
//! resolves to EXPIRED; a failure saving a computed status only logs.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use kampung_shared::types::{BillingMode, TenantStatus, TenantType};

use crate::error::BillingResult;
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};

/// Billing-relevant view of a single tenant
#[derive(Debug, Clone)]
pub struct TenantSnapshot {
    pub id: Uuid,
    pub status: TenantStatus,
    pub billing_mode: BillingMode,
    pub billing_owner_id: Option<Uuid>,
    pub trial_end_at: Option<OffsetDateTime>,
    pub subscription_ended_at: Option<OffsetDateTime>,
    /// Tenant holds an ACTIVE lifetime subscription
    pub has_lifetime: bool,
    /// `ends_at` of the tenant's own ACTIVE non-lifetime subscription
    pub own_subscription_ends_at: Option<OffsetDateTime>,
}

impl TenantSnapshot {
    fn delegated_owner(&self) -> Option<Uuid> {
        match (self.billing_mode, self.billing_owner_id) {
            (BillingMode::Delegated, Some(owner)) if owner != self.id => Some(owner),
            _ => None,
        }
    }
}

/// Result of looking up a delegated tenant's billing owner
#[derive(Debug, Clone)]
pub enum OwnerLookup {
    Found(TenantSnapshot),
    /// Owner id is set but the row is gone or soft-deleted
    Missing(Uuid),
}

/// Everything the resolver needs, loaded in one query
#[derive(Debug, Clone)]
pub struct StatusInputs {
    pub tenant: TenantSnapshot,
    pub owner: Option<OwnerLookup>,
}

/// Why a tenant ended up with its status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StatusReason {
    Lifetime,
    Unchanged,
    TrialEnded,
    SubscriptionEnded,
    OwnSubscription,
    RunningTrial,
    Inherited { owner_id: Uuid },
    OwnerIsDemo { owner_id: Uuid },
    OwnerMissing { owner_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusResolution {
    pub previous: TenantStatus,
    pub status: TenantStatus,
    pub reason: StatusReason,
}

impl StatusResolution {
    pub fn changed(&self) -> bool {
        self.previous != self.status
    }
}

/// Outcome of the tenant's own trial/subscription dates
fn own_outcome(tenant: &TenantSnapshot, now: OffsetDateTime) -> (TenantStatus, StatusReason) {
    let past = |at: Option<OffsetDateTime>| at.is_some_and(|at| at < now);

    match tenant.status {
        TenantStatus::Trial | TenantStatus::Demo if past(tenant.trial_end_at) => {
            (TenantStatus::Expired, StatusReason::TrialEnded)
        }
        TenantStatus::Active if past(tenant.subscription_ended_at) => {
            (TenantStatus::Expired, StatusReason::SubscriptionEnded)
        }
        status => (status, StatusReason::Unchanged),
    }
}

/// Status an owner would resolve to on its own (owners are roots, no inheritance)
fn owner_effective_status(owner: &TenantSnapshot, now: OffsetDateTime) -> TenantStatus {
    if owner.has_lifetime {
        return TenantStatus::Active;
    }
    own_outcome(owner, now).0
}

/// Pure status resolution. Deterministic for a given `now`.
pub fn resolve_status(inputs: &StatusInputs, now: OffsetDateTime) -> StatusResolution {
    let tenant = &inputs.tenant;
    let resolved = |(status, reason): (TenantStatus, StatusReason)| StatusResolution {
        previous: tenant.status,
        status,
        reason,
    };

    if tenant.has_lifetime {
        return resolved((TenantStatus::Active, StatusReason::Lifetime));
    }

    let Some(owner_id) = tenant.delegated_owner() else {
        return resolved(own_outcome(tenant, now));
    };

    // The tenant's own paid period beats whatever the owner is doing
    if tenant.own_subscription_ends_at.is_some_and(|ends| ends > now) {
        let (status, _) = own_outcome(tenant, now);
        return resolved((status, StatusReason::OwnSubscription));
    }

    // Only the tenant's own trial date counts; a stored TRIAL may have been inherited
    if tenant.status != TenantStatus::Demo && tenant.trial_end_at.is_some_and(|end| end >= now) {
        return resolved((TenantStatus::Trial, StatusReason::RunningTrial));
    }

    match &inputs.owner {
        Some(OwnerLookup::Found(owner)) => match owner_effective_status(owner, now) {
            status @ (TenantStatus::Active | TenantStatus::Expired | TenantStatus::Trial) => {
                resolved((status, StatusReason::Inherited { owner_id }))
            }
            TenantStatus::Demo => {
                let (status, _) = own_outcome(tenant, now);
                resolved((status, StatusReason::OwnerIsDemo { owner_id }))
            }
        },
        Some(OwnerLookup::Missing(_)) | None => {
            let (status, _) = own_outcome(tenant, now);
            resolved((status, StatusReason::OwnerMissing { owner_id }))
        }
    }
}

/// Tenant context handed to the feature gate
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedTenant {
    pub tenant_id: Uuid,
    pub status: TenantStatus,
    pub tenant_type: TenantType,
    pub reason: Option<StatusReason>,
    /// True when the status is the safe default because loading failed
    pub degraded: bool,
}

impl ResolvedTenant {
    /// The computed status stands even when saving it failed; the next request retries
    fn after_persist(
        tenant_id: Uuid,
        tenant_type: TenantType,
        resolution: &StatusResolution,
        persisted: BillingResult<()>,
    ) -> Self {
        if let Err(e) = persisted {
            tracing::error!(
                tenant_id = %tenant_id,
                from = %resolution.previous,
                to = %resolution.status,
                error = %e,
                "Failed to persist tenant status, serving the computed status"
            );
        }

        Self {
            tenant_id,
            status: resolution.status,
            tenant_type,
            reason: Some(resolution.reason),
            degraded: false,
        }
    }

    fn safe_default(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            status: TenantStatus::Expired,
            tenant_type: TenantType::Live,
            reason: None,
            degraded: true,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    id: Uuid,
    status: TenantStatus,
    tenant_type: TenantType,
    billing_mode: BillingMode,
    billing_owner_id: Option<Uuid>,
    trial_end_at: Option<OffsetDateTime>,
    subscription_ended_at: Option<OffsetDateTime>,
    has_lifetime: bool,
    own_subscription_ends_at: Option<OffsetDateTime>,
    owner_id: Option<Uuid>,
    owner_status: Option<TenantStatus>,
    owner_billing_mode: Option<BillingMode>,
    owner_trial_end_at: Option<OffsetDateTime>,
    owner_subscription_ended_at: Option<OffsetDateTime>,
    owner_has_lifetime: bool,
}

impl StatusRow {
    fn into_inputs(self) -> (StatusInputs, TenantType) {
        let tenant = TenantSnapshot {
            id: self.id,
            status: self.status,
            billing_mode: self.billing_mode,
            billing_owner_id: self.billing_owner_id,
            trial_end_at: self.trial_end_at,
            subscription_ended_at: self.subscription_ended_at,
            has_lifetime: self.has_lifetime,
            own_subscription_ends_at: self.own_subscription_ends_at,
        };

        let owner = tenant.delegated_owner().map(|expected| {
            match (self.owner_id, self.owner_status, self.owner_billing_mode) {
                (Some(id), Some(status), Some(billing_mode)) => OwnerLookup::Found(TenantSnapshot {
                    id,
                    status,
                    billing_mode,
                    billing_owner_id: None,
                    trial_end_at: self.owner_trial_end_at,
                    subscription_ended_at: self.owner_subscription_ended_at,
                    has_lifetime: self.owner_has_lifetime,
                    own_subscription_ends_at: None,
                }),
                _ => OwnerLookup::Missing(expected),
            }
        });

        (StatusInputs { tenant, owner }, self.tenant_type)
    }
}

/// Status resolution service
pub struct StatusService {
    pool: PgPool,
    events: BillingEventLogger,
}

impl StatusService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            events: BillingEventLogger::new(pool.clone()),
            pool,
        }
    }

    /// Resolve (and persist on change) the status of a tenant. Never fails: only a
    /// failed load falls back to EXPIRED.
    pub async fn resolve_for_request(&self, tenant_id: Uuid) -> ResolvedTenant {
        match self.resolve_at(tenant_id, OffsetDateTime::now_utc()).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                tracing::warn!(tenant_id = %tenant_id, "Status requested for unknown tenant");
                ResolvedTenant::safe_default(tenant_id)
            }
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Tenant status resolution failed, falling back to EXPIRED"
                );
                ResolvedTenant::safe_default(tenant_id)
            }
        }
    }

    /// Resolve at an explicit instant
    pub async fn resolve_at(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ResolvedTenant>> {
        let Some(row) = self.load_row(tenant_id).await? else {
            return Ok(None);
        };
        let (inputs, tenant_type) = row.into_inputs();
        let resolution = resolve_status(&inputs, now);

        if let StatusReason::OwnerMissing { owner_id } = resolution.reason {
            tracing::warn!(
                tenant_id = %tenant_id,
                billing_owner_id = %owner_id,
                "Data integrity: billing owner missing, not inheriting status"
            );
        }

        let persisted = if resolution.changed() {
            self.persist(tenant_id, &resolution).await
        } else {
            Ok(())
        };

        Ok(Some(ResolvedTenant::after_persist(
            tenant_id,
            tenant_type,
            &resolution,
            persisted,
        )))
    }

    async fn load_row(&self, tenant_id: Uuid) -> BillingResult<Option<StatusRow>> {
        let row: Option<StatusRow> = sqlx::query_as(
            r#"
            SELECT
                t.id,
                t.status,
                t.tenant_type,
                t.billing_mode,
                t.billing_owner_id,
                t.trial_end_at,
                t.subscription_ended_at,
                EXISTS (
                    SELECT 1 FROM subscriptions s
                    WHERE s.tenant_id = t.id
                      AND s.status = 'ACTIVE'
                      AND s.subscription_type = 'LIFETIME'
                ) AS has_lifetime,
                (
                    SELECT s.ends_at FROM subscriptions s
                    WHERE s.tenant_id = t.id
                      AND s.status = 'ACTIVE'
                      AND s.subscription_type <> 'LIFETIME'
                    ORDER BY s.ends_at DESC
                    LIMIT 1
                ) AS own_subscription_ends_at,
                o.id AS owner_id,
                o.status AS owner_status,
                o.billing_mode AS owner_billing_mode,
                o.trial_end_at AS owner_trial_end_at,
                o.subscription_ended_at AS owner_subscription_ended_at,
                EXISTS (
                    SELECT 1 FROM subscriptions s
                    WHERE s.tenant_id = o.id
                      AND s.status = 'ACTIVE'
                      AND s.subscription_type = 'LIFETIME'
                ) AS owner_has_lifetime
            FROM tenants t
            LEFT JOIN tenants o
                ON o.id = t.billing_owner_id
               AND o.id <> t.id
               AND o.deleted_at IS NULL
            WHERE t.id = $1 AND t.deleted_at IS NULL
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn persist(&self, tenant_id: Uuid, resolution: &StatusResolution) -> BillingResult<()> {
        // Concurrent requests compute the same value; the guard skips redundant writes
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status <> $2
            "#,
        )
        .bind(tenant_id)
        .bind(resolution.status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(());
        }

        tracing::info!(
            tenant_id = %tenant_id,
            from = %resolution.previous,
            to = %resolution.status,
            reason = ?resolution.reason,
            "Tenant status changed"
        );

        let event = BillingEventBuilder::new(tenant_id, BillingEventType::TenantStatusChanged)
            .data(serde_json::json!({
                "from": resolution.previous,
                "to": resolution.status,
                "reason": resolution.reason,
            }))
            .actor_type(ActorType::System);
        if let Err(e) = self.events.log_event(event).await {
            tracing::warn!(tenant_id = %tenant_id, error = %e, "Failed to record status change event");
        }

        Ok(())
    }
}
