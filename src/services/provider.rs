//! Provider capability trait and the OpenAI-compatible implementation.
//!
//! Providers are selected by name through [`ProviderRegistry`]. Every call
//! runs over a [`ProviderHandle`] borrowed from that provider's pool.

use crate::core::config::{AppConfig, ProviderConfig};
use crate::core::error::{AppError, Result};
use crate::core::metrics::PhaseDurations;
use crate::services::connection_pool::ProviderHandle;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// One prompt for one (provider, model).
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub params: GenerationParams,
}

impl GenerationRequest {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            prompt: prompt.into(),
            params: GenerationParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Provider answer for one prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: String,
    pub text: String,
    pub usage: TokenUsage,
    /// Per-item timing, when the provider could observe it
    pub phases: Option<PhaseDurations>,
}

/// Model advertised by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub supports_structured_output: bool,
    pub supports_native_batch: bool,
}

/// Capability every LLM backend implements.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn models(&self) -> Vec<ModelInfo>;

    /// Whether `model` may be requested. An empty model list accepts any model.
    fn supports_model(&self, model: &str) -> bool {
        let models = self.models();
        models.is_empty() || models.iter().any(|m| m.id == model)
    }

    /// Whether [`LlmProvider::complete_batch`] sends one request for the whole batch.
    fn supports_native_batch(&self) -> bool {
        false
    }

    async fn complete(
        &self,
        handle: &ProviderHandle,
        request: &GenerationRequest,
    ) -> Result<Completion>;

    /// Generate with the provider constraining output to `schema`.
    ///
    /// Providers without constrained decoding fall back to a plain completion
    /// and rely on validation afterwards.
    async fn complete_structured(
        &self,
        handle: &ProviderHandle,
        request: &GenerationRequest,
        _schema: &Value,
    ) -> Result<Completion> {
        self.complete(handle, request).await
    }

    /// Generate for every request of a batch, results in request order.
    ///
    /// The outer error fails the whole batch. Without a native batch API the
    /// prompts are issued concurrently over the one handle, bounded by its
    /// multiplexing limit, and each item carries its own result.
    async fn complete_batch(
        &self,
        handle: &ProviderHandle,
        requests: &[GenerationRequest],
    ) -> Result<Vec<Result<Completion>>> {
        let calls: Vec<_> = requests
            .iter()
            .map(|request| self.complete(handle, request))
            .collect();
        let results = stream::iter(calls)
            .buffered(handle.max_concurrency().max(1))
            .collect::<Vec<_>>()
            .await;
        Ok(results)
    }
}

/// Name to implementation map of configured providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut registry = Self::new();
        for provider in &config.providers {
            let implementation: Arc<dyn LlmProvider> = match provider.provider_type.as_str() {
                "openai" => Arc::new(OpenAiProvider::new(provider)),
                other => {
                    return Err(AppError::InvalidRequest(format!(
                        "Provider '{}' has unsupported provider_type '{}'",
                        provider.name, other
                    )))
                }
            };
            registry.insert(implementation);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, provider: Arc<dyn LlmProvider>) {
        tracing::info!(provider = %provider.name(), "Registered provider");
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::InvalidRequest(format!("Unknown provider: {}", name)))
    }

    /// Look up `provider` and check that it serves `model`.
    pub fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn LlmProvider>> {
        let implementation = self.get(provider)?;
        if !implementation.supports_model(model) {
            return Err(AppError::InvalidRequest(format!(
                "Model '{}' not supported by provider '{}'",
                model, provider
            )));
        }
        Ok(implementation)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every advertised model, sorted by provider then id.
    pub fn models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = self
            .providers
            .values()
            .flat_map(|provider| provider.models())
            .collect();
        models.sort_by(|a, b| a.provider.cmp(&b.provider).then_with(|| a.id.cmp(&b.id)));
        models
    }
}

/// Provider speaking the OpenAI chat completions protocol.
pub struct OpenAiProvider {
    name: String,
    models: Vec<String>,
    native_batch: bool,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            models: config.models.clone(),
            native_batch: config.native_batch,
        }
    }

    fn check_model(&self, model: &str) -> Result<()> {
        if self.supports_model(model) {
            Ok(())
        } else {
            Err(AppError::InvalidRequest(format!(
                "Model '{}' not supported by provider '{}'",
                model, self.name
            )))
        }
    }

    /// POST `payload` and return the decoded JSON body with the time to headers.
    async fn post_json(
        &self,
        handle: &ProviderHandle,
        path: &str,
        payload: &Value,
    ) -> Result<(Value, Duration)> {
        let url = format!("{}/{}", handle.base_url(), path);
        let started = Instant::now();

        let response = handle
            .client()
            .post(&url)
            .header("Authorization", format!("Bearer {}", handle.api_key()))
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(
                    provider = %self.name,
                    handle_id = handle.id(),
                    error = %e,
                    "Provider request failed"
                );
                AppError::from_transport(&e)
            })?;
        let first_byte = started.elapsed();

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .as_ref()
                .and_then(extract_error_message)
                .unwrap_or(text);

            tracing::warn!(
                provider = %self.name,
                status = status.as_u16(),
                error = %message,
                "Provider returned error status"
            );

            return Err(match AppError::from_status(status.as_u16(), &message) {
                AppError::RateLimited { message, .. } => AppError::RateLimited {
                    message,
                    retry_after,
                },
                other => other,
            });
        }

        let body = response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                AppError::ProviderTimeout(e.to_string())
            } else {
                AppError::ProviderError {
                    status: Some(status.as_u16()),
                    message: format!("Invalid JSON response from provider: {}", e),
                }
            }
        })?;

        Ok((body, first_byte))
    }

    async fn chat(
        &self,
        handle: &ProviderHandle,
        request: &GenerationRequest,
        schema: Option<&Value>,
    ) -> Result<Completion> {
        self.check_model(&request.model)?;
        let payload = chat_payload(request, schema);

        let started = Instant::now();
        let (body, first_byte) = self.post_json(handle, "chat/completions", &payload).await?;
        let total = started.elapsed();

        let text = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::ProviderError {
                status: Some(200),
                message: "Provider response has no message content".to_string(),
            })?
            .to_string();
        let usage = parse_usage(&body);

        tracing::debug!(
            provider = %self.name,
            model = %request.model,
            handle_id = handle.id(),
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            duration_ms = total.as_millis() as u64,
            "Provider completion finished"
        );

        Ok(Completion {
            id: response_id(&body),
            text,
            usage,
            phases: Some(
                PhaseDurations {
                    total,
                    time_to_first_token: Some(first_byte),
                    time_per_token: None,
                }
                .with_derived_per_token(usage.output_tokens),
            ),
        })
    }

    /// One legacy `completions` call with an array prompt.
    async fn native_batch(
        &self,
        handle: &ProviderHandle,
        requests: &[GenerationRequest],
    ) -> Result<Vec<Result<Completion>>> {
        let first = &requests[0];
        self.check_model(&first.model)?;

        let mut payload = json!({
            "model": first.model,
            "prompt": requests.iter().map(|r| r.prompt.as_str()).collect::<Vec<_>>(),
        });
        merge_params(&mut payload, &first.params);

        let (body, _) = self.post_json(handle, "completions", &payload).await?;
        let id = response_id(&body);

        let mut choices: Vec<(usize, String)> = body
            .get("choices")
            .and_then(Value::as_array)
            .map(|choices| {
                choices
                    .iter()
                    .enumerate()
                    .map(|(position, choice)| {
                        let index = choice
                            .get("index")
                            .and_then(Value::as_u64)
                            .map(|i| i as usize)
                            .unwrap_or(position);
                        let text = choice
                            .get("text")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        (index, text)
                    })
                    .collect()
            })
            .unwrap_or_default();
        choices.sort_by_key(|(index, _)| *index);

        let shares = split_usage(parse_usage(&body), choices.len());
        Ok(choices
            .into_iter()
            .zip(shares)
            .map(|((index, text), usage)| {
                Ok(Completion {
                    id: format!("{}-{}", id, index),
                    text,
                    usage,
                    phases: None,
                })
            })
            .collect())
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models
            .iter()
            .map(|id| ModelInfo {
                id: id.clone(),
                provider: self.name.clone(),
                supports_structured_output: true,
                supports_native_batch: self.native_batch,
            })
            .collect()
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    fn supports_native_batch(&self) -> bool {
        self.native_batch
    }

    async fn complete(
        &self,
        handle: &ProviderHandle,
        request: &GenerationRequest,
    ) -> Result<Completion> {
        self.chat(handle, request, None).await
    }

    async fn complete_structured(
        &self,
        handle: &ProviderHandle,
        request: &GenerationRequest,
        schema: &Value,
    ) -> Result<Completion> {
        self.chat(handle, request, Some(schema)).await
    }

    async fn complete_batch(
        &self,
        handle: &ProviderHandle,
        requests: &[GenerationRequest],
    ) -> Result<Vec<Result<Completion>>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        // The array-prompt endpoint takes one set of sampling parameters
        let uniform = requests.iter().all(|r| r.params == requests[0].params);
        if self.native_batch && uniform {
            return self.native_batch(handle, requests).await;
        }

        let calls: Vec<_> = requests
            .iter()
            .map(|request| self.complete(handle, request))
            .collect();
        let results = stream::iter(calls)
            .buffered(handle.max_concurrency().max(1))
            .collect::<Vec<_>>()
            .await;
        Ok(results)
    }
}

fn merge_params(payload: &mut Value, params: &GenerationParams) {
    if let (Value::Object(target), Ok(Value::Object(source))) =
        (payload, serde_json::to_value(params))
    {
        target.extend(source);
    }
}

fn chat_payload(request: &GenerationRequest, schema: Option<&Value>) -> Value {
    let mut payload = json!({
        "model": request.model,
        "messages": [{"role": "user", "content": request.prompt}],
    });
    merge_params(&mut payload, &request.params);

    if let Some(schema) = schema {
        let name = schema
            .get("title")
            .and_then(Value::as_str)
            .filter(|title| {
                !title.is_empty()
                    && title
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            })
            .unwrap_or("structured_output");
        payload["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": name,
                "schema": schema,
            }
        });
    }

    payload
}

fn parse_usage(body: &Value) -> TokenUsage {
    let field = |name: &str| {
        body.get("usage")
            .and_then(|u| u.get(name))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    TokenUsage::new(field("prompt_tokens"), field("completion_tokens"))
}

fn response_id(body: &Value) -> String {
    body.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("cmpl-{}", uuid::Uuid::new_v4()))
}

/// Split aggregate usage across `n` items so the shares sum to the total.
fn split_usage(total: TokenUsage, n: usize) -> Vec<TokenUsage> {
    if n == 0 {
        return Vec::new();
    }
    let share = |amount: u64, i: usize| {
        let base = amount / n as u64;
        let remainder = amount % n as u64;
        base + u64::from((i as u64) < remainder)
    };
    (0..n)
        .map(|i| TokenUsage::new(share(total.input_tokens, i), share(total.output_tokens, i)))
        .collect()
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Pull a human-readable message out of a provider error body.
pub fn extract_error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            body.get("error")
                .and_then(|e| e.as_str())
                .map(|s| s.to_string())
        })
        .or_else(|| {
            body.get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
}
