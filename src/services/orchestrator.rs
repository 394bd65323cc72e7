//! Request orchestration.
//!
//! Unstructured completions go through the [`BatchProcessor`]; structured
//! completions bypass batching, borrow a pooled handle directly and validate
//! the provider output against the requested schema.
//!
//! Once a request has been attributed to a known provider and model, every
//! way out of it records exactly one metrics entry, including the caller dropping the
//! future midway.

use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::core::error_types::ErrorCategory;
use crate::core::metrics::{MetricsCollector, PhaseDurations, RequestRecord};
use crate::services::batch_processor::BatchProcessor;
use crate::services::connection_pool::{ConnectionPools, PoolStats};
use crate::services::provider::{Completion, GenerationRequest, ProviderRegistry, TokenUsage};
use crate::validation::{
    validate_with_transformers, SchemaRegistry, TransformerRegistry, TransformerSpec,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Where a structured request takes its schema from.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaSource {
    Registered(String),
    Inline(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRequest {
    pub generation: GenerationRequest,
    pub schema: SchemaSource,
    /// Applied in order when the output does not conform
    pub transformers: Vec<TransformerSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredCompletion {
    pub id: String,
    pub output: Value,
    pub usage: TokenUsage,
    pub phases: PhaseDurations,
}

/// Records one metrics entry when finished, or `cancelled` when dropped unfinished.
struct RecordGuard<'a> {
    metrics: &'a MetricsCollector,
    provider: &'a str,
    model: &'a str,
    started: Instant,
    structured: bool,
    recorded: bool,
}

impl<'a> RecordGuard<'a> {
    fn new(metrics: &'a MetricsCollector, request: &'a GenerationRequest, structured: bool) -> Self {
        Self {
            metrics,
            provider: &request.provider,
            model: &request.model,
            started: Instant::now(),
            structured,
            recorded: false,
        }
    }

    fn elapsed(&self) -> PhaseDurations {
        PhaseDurations::from_total(self.started.elapsed())
    }

    fn finish(mut self, record: RequestRecord) {
        let record = if self.structured {
            record.structured()
        } else {
            record
        };
        self.metrics.record(self.provider, self.model, &record);
        self.recorded = true;
    }

    /// Record `error` and hand it back for propagation.
    fn fail(self, error: AppError) -> AppError {
        let record = RequestRecord::failure(self.elapsed(), error.category());
        self.finish(record);
        error
    }
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        tracing::debug!(
            provider = %self.provider,
            model = %self.model,
            "Request dropped before completion"
        );
        let mut record =
            RequestRecord::failure(self.elapsed(), ErrorCategory::Cancelled);
        if self.structured {
            record = record.structured();
        }
        self.metrics.record(self.provider, self.model, &record);
        self.recorded = true;
    }
}

/// Entry point for completions from the routing layer.
pub struct RequestOrchestrator {
    providers: ProviderRegistry,
    pools: ConnectionPools,
    batcher: BatchProcessor,
    schemas: Arc<dyn SchemaRegistry>,
    transformers: Arc<TransformerRegistry>,
    metrics: Arc<MetricsCollector>,
    request_timeout: Duration,
    acquire_timeout: Duration,
}

impl RequestOrchestrator {
    /// Build pools and the batch processor for every configured provider.
    pub fn from_config(
        config: &AppConfig,
        providers: ProviderRegistry,
        schemas: Arc<dyn SchemaRegistry>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let pools = ConnectionPools::from_config(config)?;
        let batcher = BatchProcessor::new(
            config.batch.clone(),
            config.request_timeout(),
            config.acquire_timeout(),
            providers.clone(),
            pools.clone(),
        );

        Ok(Self {
            providers,
            pools,
            batcher,
            schemas,
            transformers: Arc::new(TransformerRegistry::new()),
            metrics,
            request_timeout: config.request_timeout(),
            acquire_timeout: config.acquire_timeout(),
        })
    }

    pub fn with_transformers(mut self, transformers: Arc<TransformerRegistry>) -> Self {
        self.transformers = transformers;
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.stats()
    }

    /// Unstructured completion, batched with concurrent requests for the same model.
    pub async fn complete(&self, request: GenerationRequest) -> Result<Completion> {
        self.providers.resolve(&request.provider, &request.model)?;

        let guard = RecordGuard::new(&self.metrics, &request, false);
        let result = self.batcher.submit(request.clone()).await;

        match result {
            Ok(completion) => {
                let phases = completion.phases.unwrap_or_else(|| guard.elapsed());
                guard.finish(RequestRecord::success(
                    phases,
                    completion.usage.input_tokens,
                    completion.usage.output_tokens,
                ));
                Ok(completion)
            }
            Err(e) => Err(guard.fail(e)),
        }
    }

    /// Structured completion validated against a registered or inline schema.
    pub async fn complete_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<StructuredCompletion> {
        let provider = self
            .providers
            .resolve(&request.generation.provider, &request.generation.model)?;
        let pool = self.pools.get(&request.generation.provider)?;

        let guard = RecordGuard::new(&self.metrics, &request.generation, true);

        if let Err(e) = self.transformers.check_known(&request.transformers) {
            return Err(guard.fail(e));
        }
        let schema = match self.resolve_schema(&request.schema).await {
            Ok(schema) => schema,
            Err(e) => return Err(guard.fail(e)),
        };

        let lease = match pool.acquire(self.acquire_timeout).await {
            Ok(lease) => lease,
            Err(e) => return Err(guard.fail(e)),
        };

        let result = match tokio::time::timeout(
            self.request_timeout,
            provider.complete_structured(&lease, &request.generation, &schema),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::ProviderTimeout(format!(
                "Provider did not answer within {}s",
                self.request_timeout.as_secs()
            ))),
        };
        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !e.is_transport_failure(),
        };
        lease.release(healthy);

        let completion = match result {
            Ok(completion) => completion,
            Err(e) => return Err(guard.fail(e)),
        };
        let phases = completion.phases.unwrap_or_else(|| guard.elapsed());
        let usage = completion.usage;

        match validate_with_transformers(
            &completion.text,
            &schema,
            &request.transformers,
            &self.transformers,
        ) {
            Ok(output) => {
                guard.finish(
                    RequestRecord::success(phases, usage.input_tokens, usage.output_tokens)
                        .with_validation(true),
                );
                Ok(StructuredCompletion {
                    id: completion.id,
                    output,
                    usage,
                    phases,
                })
            }
            Err(e) => {
                let mut record = RequestRecord::failure(phases, e.category())
                    .with_tokens(usage.input_tokens, usage.output_tokens);
                if let AppError::SchemaValidation(issues) = &e {
                    tracing::info!(
                        provider = %request.generation.provider,
                        model = %request.generation.model,
                        issues = issues.len(),
                        "Structured output failed validation"
                    );
                    record = record.with_validation(false);
                }
                guard.finish(record);
                Err(e)
            }
        }
    }

    async fn resolve_schema(&self, source: &SchemaSource) -> Result<Value> {
        match source {
            SchemaSource::Registered(id) => self.schemas.resolve(id).await,
            SchemaSource::Inline(schema) if schema.is_object() => Ok(schema.clone()),
            SchemaSource::Inline(_) => Err(AppError::InvalidRequest(
                "Inline schema must be a JSON object".to_string(),
            )),
        }
    }

    /// Flush batching lanes. Call once on shutdown.
    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
    }
}
