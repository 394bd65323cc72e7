//! LLM Gateway - concurrent request pipeline for LLM providers
//!
//! This library accepts completion requests, routes them to pooled provider
//! handles and reports per-provider, per-model performance:
//!
//! - **Connection Pools**: Bounded per-provider handle pools with health-aware release
//! - **Micro-batching**: Unstructured requests for the same model are grouped by size or wait time
//! - **Structured Output**: Responses validated against registered or inline JSON schemas,
//!   with optional repair transformers
//! - **Metrics**: Latency percentiles, token totals and error counts per provider and model,
//!   as a JSON tree and in Prometheus format
//! - **Authentication**: Optional gateway API keys
//!
//! # Architecture
//!
//! - [`core`]: Core functionality (config, errors, logging, metrics, middleware)
//! - [`validation`]: Schema validation, transformers and the schema registry
//! - [`services`]: Pools, providers, batching and the request orchestrator
//! - [`api`]: HTTP handlers, request/response models and the router
//!
//! # Configuration
//!
//! Configuration is read from the YAML file named by `CONFIG_PATH`
//! (default: `config.yaml`). `${VAR}` references are expanded from the environment.
//!
//! Optional environment overrides:
//! - `HOST`, `PORT`: Server bind address
//! - `VERIFY_SSL`: Verify SSL certificates for upstream (default: true)
//! - `REQUEST_TIMEOUT_SECS`: Upstream request timeout
//! - `MAX_BATCH_SIZE`, `MAX_BATCH_WAIT_MS`: Batching window
//! - `POOL_ACQUIRE_TIMEOUT_MS`: How long a request waits for a free handle

pub mod api;
pub mod core;
pub mod services;
pub mod validation;

// Re-export commonly used types for convenience
pub use api::{router, AppState};
pub use core::{AppConfig, AppError, MetricsCollector, MetricsSnapshot, Result};
pub use services::{
    GenerationRequest, LlmProvider, ProviderRegistry, RequestOrchestrator, SchemaSource,
    StructuredRequest,
};
pub use validation::{InMemorySchemaRegistry, ValidationResult};
