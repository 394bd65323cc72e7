//! API request and response models.
//!
//! Wire shapes for the completion, schema, model listing and health
//! endpoints. Conversion into service-level requests lives here so the
//! handlers stay thin.

use crate::core::error::{AppError, Result};
use crate::core::metrics::PhaseDurations;
use crate::services::connection_pool::PoolStats;
use crate::services::orchestrator::{SchemaSource, StructuredCompletion, StructuredRequest};
use crate::services::provider::{Completion, GenerationParams, GenerationRequest, ModelInfo, TokenUsage};
use crate::validation::{SchemaDefinition, TransformerSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidRequest(format!("'{}' must not be empty", field)));
    }
    Ok(())
}

/// Unstructured completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Provider name as configured
    pub provider: String,
    pub model: String,
    pub prompt: String,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl CompletionRequest {
    pub fn into_generation(self) -> Result<GenerationRequest> {
        require_non_empty("provider", &self.provider)?;
        require_non_empty("model", &self.model)?;
        Ok(GenerationRequest::new(self.provider, self.model, self.prompt).with_params(self.params))
    }
}

/// Structured completion request. Exactly one of `schema_id` or `schema` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredCompletionRequest {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformers: Vec<TransformerSpec>,
    #[serde(flatten)]
    pub params: GenerationParams,
}

impl StructuredCompletionRequest {
    pub fn into_structured(self) -> Result<StructuredRequest> {
        require_non_empty("provider", &self.provider)?;
        require_non_empty("model", &self.model)?;

        let schema = match (self.schema_id, self.schema) {
            (Some(id), None) => SchemaSource::Registered(id),
            (None, Some(schema)) => SchemaSource::Inline(schema),
            (Some(_), Some(_)) => {
                return Err(AppError::InvalidRequest(
                    "Provide either 'schema_id' or 'schema', not both".to_string(),
                ))
            }
            (None, None) => {
                return Err(AppError::InvalidRequest(
                    "One of 'schema_id' or 'schema' is required".to_string(),
                ))
            }
        };

        Ok(StructuredRequest {
            generation: GenerationRequest::new(self.provider, self.model, self.prompt)
                .with_params(self.params),
            schema,
            transformers: self.transformers,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageResponse {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl From<TokenUsage> for UsageResponse {
    fn from(usage: TokenUsage) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
        }
    }
}

/// Phase timings in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingResponse {
    pub total_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_per_token_ms: Option<f64>,
}

impl From<PhaseDurations> for TimingResponse {
    fn from(phases: PhaseDurations) -> Self {
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1000.0;
        Self {
            total_ms: ms(phases.total),
            time_to_first_token_ms: phases.time_to_first_token.map(ms),
            time_per_token_ms: phases.time_per_token.map(ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub provider: String,
    pub model: String,
    pub text: String,
    pub usage: UsageResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<TimingResponse>,
}

impl CompletionResponse {
    pub fn new(provider: String, model: String, completion: Completion) -> Self {
        Self {
            id: completion.id,
            object: "text_completion".to_string(),
            provider,
            model,
            text: completion.text,
            usage: completion.usage.into(),
            timing: completion.phases.map(TimingResponse::from),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCompletionResponse {
    pub id: String,
    pub object: String,
    pub provider: String,
    pub model: String,
    /// Schema-conforming output
    pub output: Value,
    pub usage: UsageResponse,
    pub timing: TimingResponse,
}

impl StructuredCompletionResponse {
    pub fn new(provider: String, model: String, completion: StructuredCompletion) -> Self {
        Self {
            id: completion.id,
            object: "structured_completion".to_string(),
            provider,
            model,
            output: completion.output,
            usage: completion.usage.into(),
            timing: completion.phases.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSchemaRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub json_schema: Value,
    /// Caller-chosen id; generated when absent
    #[serde(default)]
    pub schema_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaList {
    pub object: String,
    pub data: Vec<SchemaDefinition>,
}

impl SchemaList {
    pub fn new(data: Vec<SchemaDefinition>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub providers: usize,
    pub pools: Vec<PoolStats>,
}
