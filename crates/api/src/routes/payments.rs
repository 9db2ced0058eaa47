//! Payment routes

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use kampung_billing::{Payer, PaymentInstruction, SettlementOutcome, SplitLine};
use kampung_shared::types::{InvoiceStatus, PaymentChannel, PaymentMode};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub invoice_id: Uuid,
    pub payment_channel: String,
}

#[derive(Debug, Serialize)]
pub struct PayResponse {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub payment_mode: PaymentMode,
    pub provider: String,
    pub instruction: PaymentInstruction,
    pub splits: Vec<SplitLine>,
}

/// Choose a channel for an invoice and get payment instructions
pub async fn pay(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PayRequest>,
) -> ApiResult<Json<PayResponse>> {
    let channel: PaymentChannel = req.payment_channel.parse().map_err(ApiError::Validation)?;

    let outcome = state
        .billing
        .payments
        .pay(
            req.invoice_id,
            channel,
            Payer {
                user_id: auth_user.user_id,
                tenant_id: auth_user.tenant_id,
            },
        )
        .await?;

    Ok(Json(PayResponse {
        invoice_id: outcome.invoice_id,
        status: outcome.status,
        payment_mode: outcome.payment_mode,
        provider: outcome.provider,
        instruction: outcome.instruction,
        splits: outcome.splits,
    }))
}

/// Operator marks a manual transfer as received
pub async fn confirm_manual(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<SettlementOutcome>> {
    if !auth_user.role.can_confirm_payments() {
        tracing::warn!(
            user_id = %auth_user.user_id,
            role = ?auth_user.role,
            invoice_id = %invoice_id,
            "Unauthorized manual payment confirmation attempt"
        );
        return Err(ApiError::Forbidden(
            "Only platform operators can confirm payments".to_string(),
        ));
    }

    let outcome = state
        .billing
        .activation
        .confirm_manual(invoice_id, auth_user.user_id, auth_user.role)
        .await?;

    tracing::info!(
        invoice_id = %invoice_id,
        operator_id = %auth_user.user_id,
        tenant_id = %outcome.tenant_id,
        "Manual payment confirmed"
    );

    Ok(Json(outcome))
}
