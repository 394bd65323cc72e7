//! Per-provider and per-model request metrics.
//!
//! [`MetricsCollector`] is constructed once at startup and injected into the
//! orchestrator. Each (provider, model) pair owns its own [`ModelMetrics`]
//! behind an `Arc`, so recording for one model never contends with another;
//! the map itself is only touched to look up or create an entry.
//!
//! Counters are mirrored into a collector-owned Prometheus registry for the
//! text exposition endpoint.

use crate::core::error_types::ErrorCategory;
use crate::core::percentile::{PercentileSnapshot, PercentileTracker};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timing phases observed for one request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseDurations {
    pub total: Duration,
    pub time_to_first_token: Option<Duration>,
    pub time_per_token: Option<Duration>,
}

impl PhaseDurations {
    pub fn from_total(total: Duration) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Derive time-per-token from the total when the provider did not report it.
    pub fn with_derived_per_token(mut self, output_tokens: u64) -> Self {
        if self.time_per_token.is_none() && output_tokens > 0 {
            let generation = self
                .time_to_first_token
                .map(|ttft| self.total.saturating_sub(ttft))
                .unwrap_or(self.total);
            let tokens = u32::try_from(output_tokens).unwrap_or(u32::MAX);
            self.time_per_token = Some(generation / tokens);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(ErrorCategory),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure(_) => "error",
        }
    }
}

/// Everything recorded for one completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub phases: PhaseDurations,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub outcome: Outcome,
    pub structured: bool,
    /// `Some(passed)` when structured output went through validation
    pub validation: Option<bool>,
}

impl RequestRecord {
    pub fn success(phases: PhaseDurations, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            phases,
            input_tokens,
            output_tokens,
            outcome: Outcome::Success,
            structured: false,
            validation: None,
        }
    }

    pub fn failure(phases: PhaseDurations, category: ErrorCategory) -> Self {
        Self {
            phases,
            input_tokens: 0,
            output_tokens: 0,
            outcome: Outcome::Failure(category),
            structured: false,
            validation: None,
        }
    }

    pub fn structured(mut self) -> Self {
        self.structured = true;
        self
    }

    pub fn with_validation(mut self, passed: bool) -> Self {
        self.validation = Some(passed);
        self
    }

    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }
}

/// Aggregate for one (provider, model) pair, or for a whole provider.
#[derive(Debug)]
pub struct ModelMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    structured_requests: AtomicU64,
    validation_passed: AtomicU64,
    validation_failed: AtomicU64,
    total: PercentileTracker,
    time_to_first_token: PercentileTracker,
    time_per_token: PercentileTracker,
    errors: Mutex<BTreeMap<ErrorCategory, u64>>,
}

impl ModelMetrics {
    pub fn new(reservoir_capacity: usize) -> Self {
        Self {
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            structured_requests: AtomicU64::new(0),
            validation_passed: AtomicU64::new(0),
            validation_failed: AtomicU64::new(0),
            total: PercentileTracker::new(reservoir_capacity),
            time_to_first_token: PercentileTracker::new(reservoir_capacity),
            time_per_token: PercentileTracker::new(reservoir_capacity),
            errors: Mutex::new(BTreeMap::new()),
        }
    }

    fn apply(&self, record: &RequestRecord) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(record.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(record.output_tokens, Ordering::Relaxed);

        if record.structured {
            self.structured_requests.fetch_add(1, Ordering::Relaxed);
        }
        match record.validation {
            Some(true) => {
                self.validation_passed.fetch_add(1, Ordering::Relaxed);
            }
            Some(false) => {
                self.validation_failed.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }

        self.total.record(as_millis(record.phases.total));
        if let Some(ttft) = record.phases.time_to_first_token {
            self.time_to_first_token.record(as_millis(ttft));
        }
        if let Some(tpt) = record.phases.time_per_token {
            self.time_per_token.record(as_millis(tpt));
        }

        match record.outcome {
            Outcome::Success => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure(category) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let mut errors = self
                    .errors
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *errors.entry(category).or_insert(0) += 1;
            }
        }
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        let input = self.input_tokens.load(Ordering::Relaxed);
        let output = self.output_tokens.load(Ordering::Relaxed);
        let errors = self
            .errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(category, count)| (category.as_str().to_string(), *count))
            .collect();

        ModelSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            tokens: TokenTotals {
                input,
                output,
                total: input.saturating_add(output),
            },
            structured_requests: self.structured_requests.load(Ordering::Relaxed),
            validation: ValidationCounts {
                passed: self.validation_passed.load(Ordering::Relaxed),
                failed: self.validation_failed.load(Ordering::Relaxed),
            },
            latency_ms: LatencySnapshot {
                total: self.total.snapshot(),
                time_to_first_token: self.time_to_first_token.snapshot(),
                time_per_token: self.time_per_token.snapshot(),
            },
            errors,
        }
    }
}

fn as_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationCounts {
    pub passed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySnapshot {
    pub total: PercentileSnapshot,
    pub time_to_first_token: PercentileSnapshot,
    pub time_per_token: PercentileSnapshot,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub tokens: TokenTotals,
    pub structured_requests: u64,
    pub validation: ValidationCounts,
    pub latency_ms: LatencySnapshot,
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderSnapshot {
    /// Aggregate over every model of the provider
    pub totals: ModelSnapshot,
    pub models: BTreeMap<String, ModelSnapshot>,
}

/// Tree keyed by provider, then model.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub providers: BTreeMap<String, ProviderSnapshot>,
}

/// Prometheus mirror of the collector's counters.
struct PrometheusMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    tokens_total: IntCounterVec,
    errors_total: IntCounterVec,
    request_duration: HistogramVec,
    ttft: HistogramVec,
}

impl PrometheusMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("llm_gateway_requests_total", "Total number of completed requests"),
            &["provider", "model", "outcome"],
        )
        .expect("Failed to create requests_total metric");

        let tokens_total = IntCounterVec::new(
            Opts::new("llm_gateway_tokens_total", "Total number of tokens used"),
            &["provider", "model", "token_type"],
        )
        .expect("Failed to create tokens_total metric");

        let errors_total = IntCounterVec::new(
            Opts::new("llm_gateway_errors_total", "Failed requests by error category"),
            &["provider", "model", "category"],
        )
        .expect("Failed to create errors_total metric");

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "llm_gateway_request_duration_seconds",
                "End-to-end request duration in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["provider", "model"],
        )
        .expect("Failed to create request_duration metric");

        let ttft = HistogramVec::new(
            HistogramOpts::new(
                "llm_gateway_ttft_seconds",
                "Time to first token (TTFT) in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0]),
            &["provider", "model"],
        )
        .expect("Failed to create ttft metric");

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tokens_total.clone()),
            Box::new(errors_total.clone()),
            Box::new(request_duration.clone()),
            Box::new(ttft.clone()),
        ] {
            registry
                .register(collector)
                .expect("Failed to register metric");
        }

        Self {
            registry,
            requests_total,
            tokens_total,
            errors_total,
            request_duration,
            ttft,
        }
    }

    fn observe(&self, provider: &str, model: &str, record: &RequestRecord) {
        self.requests_total
            .with_label_values(&[provider, model, record.outcome.label()])
            .inc();

        if record.input_tokens > 0 {
            self.tokens_total
                .with_label_values(&[provider, model, "prompt"])
                .inc_by(record.input_tokens);
        }
        if record.output_tokens > 0 {
            self.tokens_total
                .with_label_values(&[provider, model, "completion"])
                .inc_by(record.output_tokens);
        }

        if let Outcome::Failure(category) = record.outcome {
            self.errors_total
                .with_label_values(&[provider, model, category.as_str()])
                .inc();
        }

        self.request_duration
            .with_label_values(&[provider, model])
            .observe(record.phases.total.as_secs_f64());
        if let Some(ttft) = record.phases.time_to_first_token {
            self.ttft
                .with_label_values(&[provider, model])
                .observe(ttft.as_secs_f64());
        }
    }
}

/// Process-wide metrics registry, constructed at startup.
pub struct MetricsCollector {
    reservoir_capacity: usize,
    models: DashMap<(String, String), Arc<ModelMetrics>>,
    providers: DashMap<String, Arc<ModelMetrics>>,
    prometheus: PrometheusMetrics,
}

impl MetricsCollector {
    pub fn new(reservoir_capacity: usize) -> Self {
        Self {
            reservoir_capacity: reservoir_capacity.max(1),
            models: DashMap::new(),
            providers: DashMap::new(),
            prometheus: PrometheusMetrics::new(),
        }
    }

    /// Record one completed request. Call exactly once per request.
    pub fn record(&self, provider: &str, model: &str, record: &RequestRecord) {
        self.model_entry(provider, model).apply(record);
        self.provider_entry(provider).apply(record);
        self.prometheus.observe(provider, model, record);

        tracing::debug!(
            provider = %provider,
            model = %model,
            outcome = record.outcome.label(),
            total_ms = record.phases.total.as_millis() as u64,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            "Recorded request metrics"
        );
    }

    pub fn model_metrics(&self, provider: &str, model: &str) -> Option<Arc<ModelMetrics>> {
        self.models
            .get(&(provider.to_string(), model.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn provider_metrics(&self, provider: &str) -> Option<Arc<ModelMetrics>> {
        self.providers
            .get(provider)
            .map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of every tracker and counter.
    ///
    /// Entries are cloned out of the maps first and snapshotted afterwards,
    /// so no map lock is held while trackers are copied.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let models: Vec<((String, String), Arc<ModelMetrics>)> = self
            .models
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let providers: Vec<(String, Arc<ModelMetrics>)> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut tree: BTreeMap<String, ProviderSnapshot> = providers
            .into_iter()
            .map(|(name, metrics)| {
                (
                    name,
                    ProviderSnapshot {
                        totals: metrics.snapshot(),
                        models: BTreeMap::new(),
                    },
                )
            })
            .collect();

        for ((provider, model), metrics) in models {
            let snapshot = metrics.snapshot();
            tree.entry(provider)
                .or_insert_with(|| ProviderSnapshot {
                    totals: ModelMetrics::new(1).snapshot(),
                    models: BTreeMap::new(),
                })
                .models
                .insert(model, snapshot);
        }

        MetricsSnapshot {
            generated_at: Utc::now(),
            providers: tree,
        }
    }

    /// Render the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.prometheus.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn model_entry(&self, provider: &str, model: &str) -> Arc<ModelMetrics> {
        let key = (provider.to_string(), model.to_string());
        if let Some(existing) = self.models.get(&key) {
            return existing.value().clone();
        }
        self.models
            .entry(key)
            .or_insert_with(|| Arc::new(ModelMetrics::new(self.reservoir_capacity)))
            .value()
            .clone()
    }

    fn provider_entry(&self, provider: &str) -> Arc<ModelMetrics> {
        if let Some(existing) = self.providers.get(provider) {
            return existing.value().clone();
        }
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ModelMetrics::new(self.reservoir_capacity)))
            .value()
            .clone()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(crate::core::config::MetricsConfig::default().reservoir_capacity)
    }
}
