//! Error types and handling for the LLM gateway.
//!
//! This module provides a unified error type [`AppError`] covering the whole
//! request pipeline. Every variant maps to one [`ErrorCategory`] for metrics
//! and to one HTTP status for the routing layer.

use crate::core::error_types::{
    ErrorCategory, ERROR_TYPE_API, ERROR_TYPE_AUTHENTICATION, ERROR_TYPE_INVALID_REQUEST,
    ERROR_TYPE_NOT_FOUND, ERROR_TYPE_OVERLOADED, ERROR_TYPE_RATE_LIMIT, ERROR_TYPE_TIMEOUT,
    ERROR_TYPE_VALIDATION,
};
use crate::validation::ValidationIssue;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Main error type for the application.
///
/// The type is `Clone` so that one provider failure can be delivered to every
/// member of a batch.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    /// No pooled handle became free within the acquire timeout
    #[error("Connection pool exhausted for provider '{provider}' after {timeout_ms}ms")]
    PoolExhausted { provider: String, timeout_ms: u64 },

    /// Provider did not answer within the request timeout
    #[error("Provider timeout: {0}")]
    ProviderTimeout(String),

    /// Provider answered with 5xx, or the transport failed (`status` is `None`)
    #[error("Provider error: {message}")]
    ProviderError {
        status: Option<u16>,
        message: String,
    },

    /// Provider answered 429
    #[error("Rate limited by provider: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Client provided invalid data, or the provider rejected it with a 4xx
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Structured output never conformed to the schema
    #[error("Schema validation failed with {} issue(s)", .0.len())]
    SchemaValidation(Vec<ValidationIssue>),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    /// Authentication/authorization failures
    #[error("Unauthorized")]
    Unauthorized,

    /// Caller went away before a result was delivered
    #[error("Request cancelled")]
    Cancelled,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Classify a non-2xx provider response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate_message(body);
        match status {
            429 => AppError::RateLimited {
                message,
                retry_after: None,
            },
            400..=499 => AppError::InvalidRequest(format!("provider returned {}: {}", status, message)),
            _ => AppError::ProviderError {
                status: Some(status),
                message: format!("provider returned {}: {}", status, message),
            },
        }
    }

    /// Map a transport-level reqwest failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::ProviderTimeout(err.to_string())
        } else if let Some(status) = err.status() {
            AppError::from_status(status.as_u16(), &err.to_string())
        } else {
            AppError::ProviderError {
                status: None,
                message: err.to_string(),
            }
        }
    }

    /// The metrics category this error is counted under.
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            AppError::ProviderTimeout(_) => ErrorCategory::ProviderTimeout,
            AppError::ProviderError { .. } => ErrorCategory::ProviderError,
            AppError::RateLimited { .. } => ErrorCategory::RateLimited,
            AppError::InvalidRequest(_) | AppError::Unauthorized => ErrorCategory::InvalidRequest,
            AppError::SchemaValidation(_) => ErrorCategory::ValidationFailed,
            AppError::SchemaNotFound(_) => ErrorCategory::SchemaNotFound,
            AppError::Cancelled => ErrorCategory::Cancelled,
            AppError::Internal(_) => ErrorCategory::InternalError,
        }
    }

    /// True when the failure means the handle's connection can no longer be trusted.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, AppError::ProviderError { status: None, .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::ProviderError { .. } => StatusCode::BAD_GATEWAY,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::SchemaValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::SchemaNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            // 408 is closer to a client-side abort than nginx's non-standard 499
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::PoolExhausted { .. } => ERROR_TYPE_OVERLOADED,
            AppError::ProviderTimeout(_) | AppError::Cancelled => ERROR_TYPE_TIMEOUT,
            AppError::RateLimited { .. } => ERROR_TYPE_RATE_LIMIT,
            AppError::InvalidRequest(_) => ERROR_TYPE_INVALID_REQUEST,
            AppError::SchemaValidation(_) => ERROR_TYPE_VALIDATION,
            AppError::SchemaNotFound(_) => ERROR_TYPE_NOT_FOUND,
            AppError::Unauthorized => ERROR_TYPE_AUTHENTICATION,
            AppError::ProviderError { .. } | AppError::Internal(_) => ERROR_TYPE_API,
        }
    }
}

fn truncate_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_MESSAGE_LEN {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization error: {}", err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();
        let category = self.category();

        if matches!(self, AppError::Cancelled) {
            tracing::info!("Client disconnected before request completed");
        }

        let mut error = json!({
            "message": self.to_string(),
            "type": error_type,
            "code": category.as_str(),
        });

        if let AppError::SchemaValidation(issues) = &self {
            error["errors"] = json!(issues);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();

        if let AppError::RateLimited {
            retry_after: Some(after),
            ..
        } = &self
        {
            if let Ok(value) = after.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::Unauthorized;
        assert_eq!(err.to_string(), "Unauthorized");

        let err = AppError::Internal("test error".to_string());
        assert_eq!(err.to_string(), "Internal server error: test error");

        let err = AppError::PoolExhausted {
            provider: "groq".to_string(),
            timeout_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "Connection pool exhausted for provider 'groq' after 250ms"
        );
    }

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            AppError::from_status(429, "slow down"),
            AppError::RateLimited { .. }
        ));
        assert!(matches!(
            AppError::from_status(400, "bad prompt"),
            AppError::InvalidRequest(_)
        ));
        assert!(matches!(
            AppError::from_status(404, "no such model"),
            AppError::InvalidRequest(_)
        ));
        assert!(matches!(
            AppError::from_status(503, "overloaded"),
            AppError::ProviderError {
                status: Some(503),
                ..
            }
        ));
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            AppError::from_status(500, "").category(),
            ErrorCategory::ProviderError
        );
        assert_eq!(
            AppError::SchemaValidation(vec![]).category(),
            ErrorCategory::ValidationFailed
        );
        assert_eq!(
            AppError::SchemaNotFound("x".into()).category(),
            ErrorCategory::SchemaNotFound
        );
        assert_eq!(AppError::Cancelled.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_transport_failure_detection() {
        let transport = AppError::ProviderError {
            status: None,
            message: "connection reset".into(),
        };
        assert!(transport.is_transport_failure());
        assert!(!AppError::from_status(502, "bad gateway").is_transport_failure());
        assert!(!AppError::ProviderTimeout("slow".into()).is_transport_failure());
    }

    #[test]
    fn test_error_into_response_status() {
        let cases = vec![
            (
                AppError::PoolExhausted {
                    provider: "p".into(),
                    timeout_ms: 1,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::ProviderTimeout("t".into()),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (AppError::from_status(500, "boom"), StatusCode::BAD_GATEWAY),
            (
                AppError::from_status(429, "later"),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (AppError::from_status(422, "nope"), StatusCode::BAD_REQUEST),
            (
                AppError::SchemaValidation(vec![]),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (AppError::SchemaNotFound("s".into()), StatusCode::NOT_FOUND),
            (AppError::Unauthorized, StatusCode::UNAUTHORIZED),
            (AppError::Cancelled, StatusCode::REQUEST_TIMEOUT),
            (
                AppError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let err = AppError::RateLimited {
            message: "later".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        let response = err.into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "3");
    }

    #[test]
    fn test_long_provider_message_is_truncated() {
        let body = "x".repeat(2000);
        match AppError::from_status(500, &body) {
            AppError::ProviderError { message, .. } => {
                assert!(message.len() < 600);
                assert!(message.ends_with("..."));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let app_err: AppError = json_err.into();
        assert!(matches!(app_err, AppError::Internal(_)));
    }

    #[test]
    fn test_error_is_cloneable_for_fan_out() {
        let err = AppError::from_status(503, "down");
        let copies: Vec<AppError> = (0..3).map(|_| err.clone()).collect();
        assert!(copies
            .iter()
            .all(|e| e.category() == ErrorCategory::ProviderError));
    }
}
