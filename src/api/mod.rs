//! API layer for the LLM gateway.
//!
//! This module contains the HTTP handlers, request/response models,
//! authentication and the router wiring them together.

pub mod auth;
pub mod handlers;
pub mod models;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::core::middleware::request_context_middleware;

// Re-export commonly used types
pub use auth::{auth_middleware, verify_auth};
pub use handlers::AppState;
pub use models::{
    CompletionRequest, CompletionResponse, CreateSchemaRequest, HealthResponse, ModelList,
    SchemaList, StructuredCompletionRequest, StructuredCompletionResponse,
};

/// Build the application router.
///
/// `/v1` routes sit behind API key authentication; health and metrics do not.
pub fn router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/v1/completions", post(handlers::completions))
        .route(
            "/v1/structured-completions",
            post(handlers::structured_completions),
        )
        .route("/v1/models", get(handlers::list_models))
        .route(
            "/v1/schemas",
            post(handlers::create_schema).get(handlers::list_schemas),
        )
        .route(
            "/v1/schemas/:id",
            get(handlers::get_schema)
                .put(handlers::update_schema)
                .delete(handlers::delete_schema),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(v1)
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_snapshot))
        .route("/metrics/prometheus", get(handlers::metrics_prometheus))
        .layer(middleware::from_fn(request_context_middleware))
        .with_state(state)
}
