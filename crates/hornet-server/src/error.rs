//! HORNET: API Error Mapping
//!
//! Every error response is `{error, request_id, detail?}`. Cross-tenant
//! access maps to 404 so nothing about other tenants' resources leaks.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use hornet_bus::BusError;
use hornet_store::StoreError;
use hornet_types::HornetError;

use crate::middleware::current_request_id;

/// Error wrapper implementing the HTTP mapping for [`HornetError`].
#[derive(Debug)]
pub struct ApiError(pub HornetError);

impl ApiError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self(HornetError::Validation(detail.into()))
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self(HornetError::Auth(detail.into()))
    }

    pub fn not_found() -> Self {
        Self(HornetError::TenantIsolation)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self(HornetError::Internal(detail.into()))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            HornetError::Auth(_) => StatusCode::UNAUTHORIZED,
            HornetError::TenantIsolation => StatusCode::NOT_FOUND,
            HornetError::Validation(_) => StatusCode::BAD_REQUEST,
            HornetError::Conflict(_) => StatusCode::CONFLICT,
            HornetError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            HornetError::Connector(_) => StatusCode::BAD_GATEWAY,
            HornetError::BudgetExhausted { .. }
            | HornetError::DeadlineExceeded { .. }
            | HornetError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<HornetError> for ApiError {
    fn from(err: HornetError) -> Self {
        Self(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err.into())
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        Self(HornetError::Transient(err.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = current_request_id();
        if status.is_server_error() {
            tracing::error!(request_id = %request_id, error = %self.0, "request failed");
        }

        // Not-found keeps its detail empty on purpose.
        let detail = match &self.0 {
            HornetError::TenantIsolation => None,
            other => Some(other.to_string()),
        };
        let body = json!({
            "error": self.0.code(),
            "request_id": request_id,
            "detail": detail,
        });
        (status, Json(body)).into_response()
    }
}
