//! Tenant status and feature gate middleware
//!
//! Runs after `require_auth` on every tenant-scoped route:
//! `resolve_tenant_status` puts a [`ResolvedTenant`] in the request extensions and
//! `feature_gate` turns it into an allow/deny decision for the matched route.

use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use kampung_billing::{gate, GateDecision, ResolvedTenant, RouteIdentity};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn resolve_tenant_status(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let tenant_id = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| user.tenant_id)
        .ok_or(ApiError::Unauthorized)?;

    let resolved = state.billing.status.resolve_for_request(tenant_id).await;
    request.extensions_mut().insert(resolved);

    Ok(next.run(request).await)
}

pub async fn feature_gate(request: Request, next: Next) -> Result<Response, ApiError> {
    let (tenant_id, decision) = {
        let Some(resolved) = request.extensions().get::<ResolvedTenant>() else {
            tracing::error!(
                path = %request.uri().path(),
                "feature_gate ran without a resolved tenant, denying"
            );
            return Err(ApiError::FeatureGate {
                code: gate::SUBSCRIPTION_EXPIRED,
                status: StatusCode::PAYMENT_REQUIRED,
            });
        };
        let matched = request.extensions().get::<MatchedPath>().map(MatchedPath::as_str);
        let route = RouteIdentity::new(matched, request.uri().path());

        (
            resolved.tenant_id,
            gate::evaluate(
                resolved.status,
                resolved.tenant_type,
                request.method().as_str(),
                &route,
            ),
        )
    };

    match decision {
        GateDecision::Allow => Ok(next.run(request).await),
        GateDecision::Deny { code, http_status } => {
            tracing::info!(
                tenant_id = %tenant_id,
                method = %request.method(),
                path = %request.uri().path(),
                code = code,
                "Request blocked by feature gate"
            );
            Err(ApiError::FeatureGate {
                code,
                status: StatusCode::from_u16(http_status).unwrap_or(StatusCode::FORBIDDEN),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        routing::{get, post},
        Router,
    };
    use kampung_shared::types::{TenantStatus, TenantType};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn ok() -> &'static str {
        "ok"
    }

    fn app(status: TenantStatus, tenant_type: TenantType) -> Router {
        let resolved = ResolvedTenant {
            tenant_id: Uuid::new_v4(),
            status,
            tenant_type,
            reason: None,
            degraded: false,
        };

        let routes = Router::new()
            .route("/announcements", get(ok).post(ok))
            .route("/exports/:kind", get(ok))
            .route("/billing-warga/dues", get(ok))
            .route("/payments/pay", post(ok))
            .route("/auth/logout", post(ok))
            .route_layer(axum::middleware::from_fn(feature_gate))
            .route_layer(axum::middleware::from_fn(
                move |mut request: Request, next: Next| {
                    let resolved = resolved.clone();
                    async move {
                        request.extensions_mut().insert(resolved);
                        next.run(request).await
                    }
                },
            ));

        Router::new().nest("/api/v1", routes)
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_active_tenant_passes() {
        let (status, _) = send(
            app(TenantStatus::Active, TenantType::Live),
            "POST",
            "/api/v1/announcements",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_expired_write_is_402() {
        let (status, body) = send(
            app(TenantStatus::Expired, TenantType::Live),
            "POST",
            "/api/v1/announcements",
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["code"], "SUBSCRIPTION_EXPIRED");
    }

    #[tokio::test]
    async fn test_expired_can_pay_and_read() {
        let app = app(TenantStatus::Expired, TenantType::Live);
        let (status, _) = send(app.clone(), "POST", "/api/v1/payments/pay").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(app, "GET", "/api/v1/announcements").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_demo_is_read_only() {
        let app = app(TenantStatus::Demo, TenantType::Demo);
        let (status, body) = send(app.clone(), "POST", "/api/v1/announcements").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "DEMO_READ_ONLY");

        let (status, _) = send(app, "POST", "/api/v1/auth/logout").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_trial_locked_features_use_matched_route() {
        let app = app(TenantStatus::Trial, TenantType::Live);
        let (status, body) = send(app.clone(), "GET", "/api/v1/exports/residents").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "TRIAL_FEATURE_LOCKED");

        let (status, _) = send(app.clone(), "GET", "/api/v1/billing-warga/dues").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = send(app, "POST", "/api/v1/announcements").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_resolution_denies() {
        let app = Router::new()
            .route("/announcements", get(ok))
            .route_layer(axum::middleware::from_fn(feature_gate));
        let (status, body) = send(app, "GET", "/announcements").await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["code"], "SUBSCRIPTION_EXPIRED");
    }
}
