//! HTTP request handlers for the gateway endpoints.
//!
//! Handlers parse the wire request, hand it to the [`RequestOrchestrator`]
//! and map the result back. Errors are returned as [`AppError`] and rendered
//! by its `IntoResponse` implementation.

use crate::api::models::{
    CompletionRequest, CompletionResponse, CreateSchemaRequest, HealthResponse, ModelList,
    SchemaList, StructuredCompletionRequest, StructuredCompletionResponse,
};
use crate::core::error::{AppError, Result};
use crate::core::logging::{get_request_id, PROVIDER_CONTEXT};
use crate::core::metrics::{MetricsCollector, MetricsSnapshot};
use crate::services::orchestrator::RequestOrchestrator;
use crate::validation::{InMemorySchemaRegistry, SchemaDefinition, SchemaUpdate};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub schemas: Arc<InMemorySchemaRegistry>,
    pub metrics: Arc<MetricsCollector>,
    /// Accepted gateway keys; empty disables authentication
    pub api_keys: Vec<String>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<RequestOrchestrator>,
        schemas: Arc<InMemorySchemaRegistry>,
        api_keys: Vec<String>,
    ) -> Self {
        let metrics = orchestrator.metrics().clone();
        Self {
            orchestrator,
            schemas,
            metrics,
            api_keys,
        }
    }
}

/// Handle unstructured completions.
#[tracing::instrument(
    skip(state, payload),
    fields(provider = %payload.provider, model = %payload.model)
)]
pub async fn completions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>> {
    let request = payload.into_generation()?;
    let provider = request.provider.clone();
    let model = request.model.clone();

    PROVIDER_CONTEXT
        .scope(provider.clone(), async move {
            tracing::debug!(
                request_id = %get_request_id(),
                provider = %provider,
                model = %model,
                "Processing completion request"
            );

            let completion = state.orchestrator.complete(request).await?;
            Ok(Json(CompletionResponse::new(provider, model, completion)))
        })
        .await
}

/// Handle structured completions.
#[tracing::instrument(
    skip(state, payload),
    fields(provider = %payload.provider, model = %payload.model)
)]
pub async fn structured_completions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StructuredCompletionRequest>,
) -> Result<Json<StructuredCompletionResponse>> {
    let request = payload.into_structured()?;
    let provider = request.generation.provider.clone();
    let model = request.generation.model.clone();

    PROVIDER_CONTEXT
        .scope(provider.clone(), async move {
            tracing::debug!(
                request_id = %get_request_id(),
                provider = %provider,
                model = %model,
                transformers = request.transformers.len(),
                "Processing structured completion request"
            );

            let completion = state.orchestrator.complete_structured(request).await?;
            Ok(Json(StructuredCompletionResponse::new(
                provider, model, completion,
            )))
        })
        .await
}

/// List models advertised by every provider.
#[tracing::instrument(skip(state))]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list".to_string(),
        data: state.orchestrator.providers().models(),
    })
}

#[tracing::instrument(skip(state, payload), fields(name = %payload.name))]
pub async fn create_schema(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSchemaRequest>,
) -> Result<(StatusCode, Json<SchemaDefinition>)> {
    let definition = state.schemas.register(
        payload.json_schema,
        payload.name,
        payload.description,
        payload.schema_id,
    )?;
    Ok((StatusCode::CREATED, Json(definition)))
}

#[tracing::instrument(skip(state))]
pub async fn list_schemas(State(state): State<Arc<AppState>>) -> Json<SchemaList> {
    Json(SchemaList::new(state.schemas.list()))
}

#[tracing::instrument(skip(state))]
pub async fn get_schema(
    State(state): State<Arc<AppState>>,
    Path(schema_id): Path<String>,
) -> Result<Json<SchemaDefinition>> {
    state
        .schemas
        .get(&schema_id)
        .map(Json)
        .ok_or(AppError::SchemaNotFound(schema_id))
}

#[tracing::instrument(skip(state, payload))]
pub async fn update_schema(
    State(state): State<Arc<AppState>>,
    Path(schema_id): Path<String>,
    Json(payload): Json<SchemaUpdate>,
) -> Result<Json<SchemaDefinition>> {
    state.schemas.update(&schema_id, payload).map(Json)
}

#[tracing::instrument(skip(state))]
pub async fn delete_schema(
    State(state): State<Arc<AppState>>,
    Path(schema_id): Path<String>,
) -> Result<StatusCode> {
    state.schemas.delete(&schema_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Metrics tree keyed by provider and model.
#[tracing::instrument(skip(state))]
pub async fn metrics_snapshot(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

/// Prometheus metrics endpoint.
#[tracing::instrument(skip(state))]
pub async fn metrics_prometheus(State(state): State<Arc<AppState>>) -> Result<Response> {
    let body = state
        .metrics
        .render_prometheus()
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
        body,
    )
        .into_response())
}

/// Liveness plus per-provider pool occupancy.
#[tracing::instrument(skip(state))]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pools = state.orchestrator.pool_stats();
    let status = if pools.iter().any(|p| p.capacity > 0 && p.idle + p.in_use == 0) {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        providers: state.orchestrator.providers().names().len(),
        pools,
    })
}
