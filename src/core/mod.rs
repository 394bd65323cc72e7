//! Core functionality for the LLM gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Metrics collection and percentile tracking
//! - HTTP middleware

pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod percentile;

// Re-export commonly used types
pub use config::{AppConfig, BatchConfig, MetricsConfig, PoolSettings, ProviderConfig, ServerConfig};
pub use error::{AppError, Result};
pub use error_types::ErrorCategory;
pub use logging::{
    generate_request_id, get_provider_context, get_request_id, init_tracing, PROVIDER_CONTEXT,
    REQUEST_ID,
};
pub use metrics::{MetricsCollector, MetricsSnapshot, Outcome, PhaseDurations, RequestRecord};
pub use percentile::{PercentileSnapshot, PercentileTracker};
