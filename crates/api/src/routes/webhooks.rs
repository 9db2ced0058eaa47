//! Payment engine webhook route

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;

use kampung_billing::SIGNATURE_HEADER;

use crate::{error::ApiResult, state::AppState};

/// Signed settlement notification from a payment provider
pub async fn payment_notification(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    tracing::info!(provider = %provider, body_len = body.len(), "Payment webhook received");

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    let outcome = state
        .billing
        .webhooks
        .handle_payment(&provider, signature, &body)
        .await
        .map_err(|e| {
            tracing::warn!(provider = %provider, error = %e, "Payment webhook rejected");
            e
        })?;

    Ok(Json(json!({ "received": true, "outcome": outcome })))
}
