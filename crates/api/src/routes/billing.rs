//! Subscription and invoice routes

use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kampung_billing::InvoiceView;
use kampung_shared::types::InvoiceStatus;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan_code: String,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub amount: i64,
    pub status: InvoiceStatus,
    /// False when an open invoice for the plan was returned
    pub created: bool,
}

/// Issue (or return the open) invoice for a plan
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscribeResponse>> {
    let plan_code = req.plan_code.trim();
    if plan_code.is_empty() {
        return Err(ApiError::Validation("plan_code is required".to_string()));
    }

    let outcome = state
        .billing
        .subscribe
        .subscribe(auth_user.tenant_id, plan_code, auth_user.user_id)
        .await?;

    Ok(Json(SubscribeResponse {
        invoice_id: outcome.invoice.id,
        invoice_number: outcome.invoice.invoice_number,
        amount: outcome.invoice.amount,
        status: outcome.invoice.status,
        created: outcome.created,
    }))
}

/// Latest invoice of the caller's tenant with its splits and payment instruction
pub async fn current_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<InvoiceView>> {
    state
        .billing
        .invoices
        .current_for_tenant(auth_user.tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No invoice for this tenant".to_string()))
}
