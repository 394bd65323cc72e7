//! Shared constants for structured API errors and the metrics error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_OVERLOADED: &str = "overloaded_error";
pub const ERROR_TYPE_VALIDATION: &str = "validation_error";
pub const ERROR_TYPE_NOT_FOUND: &str = "not_found_error";

pub const ERROR_CATEGORY_POOL_EXHAUSTED: &str = "pool_exhausted";
pub const ERROR_CATEGORY_PROVIDER_TIMEOUT: &str = "provider_timeout";
pub const ERROR_CATEGORY_PROVIDER_ERROR: &str = "provider_error";
pub const ERROR_CATEGORY_RATE_LIMITED: &str = "rate_limited";
pub const ERROR_CATEGORY_INVALID_REQUEST: &str = "invalid_request";
pub const ERROR_CATEGORY_VALIDATION_FAILED: &str = "validation_failed";
pub const ERROR_CATEGORY_SCHEMA_NOT_FOUND: &str = "schema_not_found";
pub const ERROR_CATEGORY_CANCELLED: &str = "cancelled";
pub const ERROR_CATEGORY_INTERNAL_ERROR: &str = "internal_error";

/// Error category recorded in per-model metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PoolExhausted,
    ProviderTimeout,
    ProviderError,
    RateLimited,
    InvalidRequest,
    ValidationFailed,
    SchemaNotFound,
    Cancelled,
    InternalError,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        Self::PoolExhausted,
        Self::ProviderTimeout,
        Self::ProviderError,
        Self::RateLimited,
        Self::InvalidRequest,
        Self::ValidationFailed,
        Self::SchemaNotFound,
        Self::Cancelled,
        Self::InternalError,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PoolExhausted => ERROR_CATEGORY_POOL_EXHAUSTED,
            Self::ProviderTimeout => ERROR_CATEGORY_PROVIDER_TIMEOUT,
            Self::ProviderError => ERROR_CATEGORY_PROVIDER_ERROR,
            Self::RateLimited => ERROR_CATEGORY_RATE_LIMITED,
            Self::InvalidRequest => ERROR_CATEGORY_INVALID_REQUEST,
            Self::ValidationFailed => ERROR_CATEGORY_VALIDATION_FAILED,
            Self::SchemaNotFound => ERROR_CATEGORY_SCHEMA_NOT_FOUND,
            Self::Cancelled => ERROR_CATEGORY_CANCELLED,
            Self::InternalError => ERROR_CATEGORY_INTERNAL_ERROR,
        }
    }

    /// Whether a caller may retry the same request unchanged.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::PoolExhausted | Self::ProviderTimeout | Self::ProviderError | Self::RateLimited
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
