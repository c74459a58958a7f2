//! HORNET: Request Middleware
//!
//! Request-id propagation with structured request logging, and tenant-tier
//! rate limiting with the standard X-RateLimit headers.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use hornet_store::ApiKeyValidator;

use crate::auth::extract_api_key;
use crate::state::AppState;

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Request id for the current task, or "unknown" outside a request scope.
pub fn current_request_id() -> String {
    REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Assigns a request id (honoring an inbound X-Request-ID), logs the
/// request, and stamps the id on the response.
pub async fn request_context(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    let status = response.status().as_u16();
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        duration_ms = started.elapsed().as_millis() as u64,
        "http request"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

/// Paths that skip rate limiting entirely.
fn exempt(path: &str) -> bool {
    path == "/"
        || path == "/metrics"
        || path.starts_with("/api/v1/health")
        || path.starts_with("/api/v1/webhooks")
        || path.starts_with("/api/v1/ws")
        || path.starts_with("/api/v1/edge/connect")
}

/// Token-bucket rate limiting per (tenant, endpoint path), parameters from
/// the tenant's subscription tier. Runs before authentication; an
/// unauthenticated request passes through and fails in the auth extractor.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if exempt(&path) {
        return next.run(request).await;
    }

    let Some(api_key) = extract_api_key(request.headers(), request.uri().query()) else {
        return next.run(request).await;
    };
    let Ok(Some(identity)) = state.validator.validate(&api_key).await else {
        return next.run(request).await;
    };

    let key = format!("{}:{}", identity.tenant_id, path);
    let decision = state
        .rate_limiter
        .acquire(&key, identity.tier.requests_per_minute());

    if !decision.allowed {
        metrics::increment_counter!("hornet_rate_limited_total");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate_limit_exceeded",
                "request_id": current_request_id(),
            })),
        )
            .into_response();
        apply_headers(&mut response, decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, decision);
    response
}

fn apply_headers(response: &mut Response, decision: hornet_bus::RateDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_secs.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}
