//! API routes

pub mod billing;
pub mod health;
pub mod payments;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    auth::require_auth,
    middleware::{feature_gate, resolve_tenant_status},
    state::AppState,
};

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Provider callbacks authenticate with a signature, not a bearer token
    let public_api_routes = Router::new().route(
        "/webhooks/:provider/payment",
        post(webhooks::payment_notification),
    );

    // Tenant-scoped routes: auth -> status resolution -> feature gate -> handler
    let tenant_api_routes = Router::new()
        .route("/billing/subscribe", post(billing::subscribe))
        .route("/invoices/current", get(billing::current_invoice))
        .route("/payments/pay", post(payments::pay))
        .route_layer(middleware::from_fn(feature_gate))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_tenant_status,
        ))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    // Platform operator routes: authenticated, not gated by the caller's tenant status
    let operator_api_routes = Router::new()
        .route(
            "/payments/:invoice_id/confirm-manual",
            post(payments::confirm_manual),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    let api_v1_routes = Router::new()
        .merge(public_api_routes)
        .merge(tenant_api_routes)
        .merge(operator_api_routes);

    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::{body::Body, http::Request, http::StatusCode};
    use kampung_billing::{
        BillingConfig, FeeRate, ManualTransferConfig, PaymentEngineConfig, PlanCatalog,
    };
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            cors_allowed_origins: vec![],
            database_url: "postgres://localhost/kampung_test".to_string(),
            database_max_connections: 1,
            run_migrations: false,
            jwt_secret: "test-secret-key-at-least-32-chars!".to_string(),
            billing: BillingConfig {
                platform_fee: FeeRate::from_basis_points(500).unwrap(),
                plans: PlanCatalog::parse("rt_monthly=MONTHLY:50000").unwrap(),
                payment_engine: PaymentEngineConfig {
                    base_url: "http://127.0.0.1:9".to_string(),
                    timeout: Duration::from_millis(100),
                    provider_name: "xendit".to_string(),
                    webhook_secret: "whsec_test".to_string(),
                },
                manual_transfer: ManualTransferConfig {
                    bank_name: "Bank Test".to_string(),
                    account_number: "1234567890".to_string(),
                    account_holder: "PT Kampung Test".to_string(),
                },
                renewal_window_days: 7,
            },
        };
        // Never connects unless a handler reaches the database
        let pool = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        AppState::new(pool, config).unwrap()
    }

    async fn post_json(app: Router, uri: &str, headers: &[(&str, &str)], body: &str) -> StatusCode {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        app.oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_tenant_routes_require_auth() {
        let app = create_router(test_state());
        let status = post_json(app, "/api/v1/billing/subscribe", &[], r#"{"plan_code":"rt_monthly"}"#).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_confirm_manual_requires_operator_role() {
        let state = test_state();
        let token = state
            .jwt_manager
            .generate_token(
                uuid::Uuid::new_v4(),
                uuid::Uuid::new_v4(),
                "MEMBER",
                time::Duration::hours(1),
            )
            .unwrap();
        let auth = format!("Bearer {}", token);

        let uri = format!("/api/v1/payments/{}/confirm-manual", uuid::Uuid::new_v4());
        let status = post_json(create_router(state), &uri, &[("authorization", auth.as_str())], "").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_webhook_provider_is_404() {
        let app = create_router(test_state());
        let status = post_json(app, "/api/v1/webhooks/midtrans/payment", &[], "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_bad_signature_is_400() {
        let app = create_router(test_state());
        let status = post_json(
            app,
            "/api/v1/webhooks/xendit/payment",
            &[("x-kampung-signature", "t=1,v1=deadbeef")],
            r#"{"reference":"IURAN-x","status":"PAID"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_pending_status_is_acknowledged() {
        let app = create_router(test_state());
        let body = format!(
            r#"{{"reference":"IURAN-{}","status":"PENDING"}}"#,
            uuid::Uuid::new_v4()
        );
        let header = kampung_billing::webhook::sign(
            "whsec_test",
            time::OffsetDateTime::now_utc().unix_timestamp(),
            body.as_bytes(),
        )
        .unwrap();

        let status = post_json(
            app,
            "/api/v1/webhooks/xendit/payment",
            &[("x-kampung-signature", header.as_str())],
            &body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_liveness() {
        let response = create_router(test_state())
            .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
