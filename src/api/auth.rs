//! API key authentication.
//!
//! Clients authenticate with either `x-api-key` or `Authorization: Bearer`.
//! When no keys are configured, authentication is disabled.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::api::handlers::AppState;
use crate::core::error::{AppError, Result};

/// Extract the API key from headers. `x-api-key` takes priority.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| extract_bearer(headers))
}

/// Extract Bearer token from Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// Check the request headers against the configured keys.
///
/// Returns `Ok(())` when authentication is disabled or a configured key matches.
pub fn verify_auth(headers: &HeaderMap, api_keys: &[String]) -> Result<()> {
    if api_keys.is_empty() {
        return Ok(());
    }

    let provided = extract_api_key(headers).ok_or(AppError::Unauthorized)?;
    if api_keys.iter().any(|key| key == provided) {
        tracing::debug!("Authentication successful");
        Ok(())
    } else {
        tracing::debug!("Rejected unknown API key");
        Err(AppError::Unauthorized)
    }
}

/// Middleware guarding the `/v1` routes.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response> {
    verify_auth(request.headers(), &state.api_keys)?;
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn keys() -> Vec<String> {
        vec!["sk-gateway".to_string()]
    }

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-test-key".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("sk-test-key"));
    }

    #[test]
    fn test_extract_bearer_wrong_format() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn test_extract_api_key_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-bearer".parse().unwrap());
        headers.insert("x-api-key", "sk-header".parse().unwrap());
        assert_eq!(extract_api_key(&headers), Some("sk-header"));
    }

    #[test]
    fn test_verify_auth_disabled_without_keys() {
        assert!(verify_auth(&HeaderMap::new(), &[]).is_ok());
    }

    #[test]
    fn test_verify_auth_requires_key() {
        assert_matches!(
            verify_auth(&HeaderMap::new(), &keys()),
            Err(AppError::Unauthorized)
        );
    }

    #[test]
    fn test_verify_auth_accepts_either_header() {
        let mut bearer = HeaderMap::new();
        bearer.insert("authorization", "Bearer sk-gateway".parse().unwrap());
        assert!(verify_auth(&bearer, &keys()).is_ok());

        let mut x_api_key = HeaderMap::new();
        x_api_key.insert("x-api-key", "sk-gateway".parse().unwrap());
        assert!(verify_auth(&x_api_key, &keys()).is_ok());
    }

    #[test]
    fn test_verify_auth_rejects_wrong_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-wrong".parse().unwrap());
        assert_matches!(verify_auth(&headers, &keys()), Err(AppError::Unauthorized));
    }
}
