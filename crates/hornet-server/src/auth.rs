//! HORNET: Request Authentication
//!
//! The credential is an API key carried as a bearer token, an `X-API-Key`
//! header, or an `api_key` query parameter. The extractor resolves it to a
//! [`TenantIdentity`] that handlers carry explicitly; nothing tenant-bound
//! lives in process globals.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use hornet_store::ApiKeyValidator;
use hornet_types::TenantIdentity;

use crate::error::ApiError;
use crate::state::AppState;

/// Pull the API key out of a request: bearer header, X-API-Key header, or
/// api_key query parameter, in that order.
pub fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get("Authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = headers.get("X-API-Key").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("api_key=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Authenticated tenant extractor for API handlers.
pub struct AuthedTenant(pub TenantIdentity);

impl FromRequestParts<AppState> for AuthedTenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let api_key = extract_api_key(&parts.headers, parts.uri.query())
            .ok_or_else(|| ApiError::unauthorized("API key required"))?;

        let identity = state
            .validator
            .validate(&api_key)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::unauthorized("invalid API key"))?;

        tracing::debug!(tenant_id = %identity.tenant_id, key_id = %identity.key_id, "tenant authenticated");
        Ok(AuthedTenant(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_header_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer hnt_abc"));
        headers.insert("X-API-Key", HeaderValue::from_static("hnt_other"));
        assert_eq!(
            extract_api_key(&headers, None).as_deref(),
            Some("hnt_abc")
        );
    }

    #[test]
    fn test_header_and_query_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_static("hnt_header"));
        assert_eq!(
            extract_api_key(&headers, None).as_deref(),
            Some("hnt_header")
        );

        let headers = HeaderMap::new();
        assert_eq!(
            extract_api_key(&headers, Some("foo=1&api_key=hnt_query")).as_deref(),
            Some("hnt_query")
        );
        assert!(extract_api_key(&headers, Some("foo=1")).is_none());
        assert!(extract_api_key(&headers, None).is_none());
    }

    #[test]
    fn test_empty_values_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer "));
        assert!(extract_api_key(&headers, Some("api_key=")).is_none());
    }
}
