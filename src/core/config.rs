//! Configuration management for the LLM gateway.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion and overrides.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::sync::OnceLock;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// List of LLM provider configurations
    pub providers: Vec<ProviderConfig>,

    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Connection pool behaviour shared by all providers
    #[serde(default)]
    pub pool: PoolSettings,

    /// Batching lane behaviour for unstructured completions
    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Request timeout in seconds for upstream providers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Accepted gateway API keys. Empty disables authentication.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name (for routing, logging and metrics)
    pub name: String,

    /// Wire protocol spoken by the provider
    #[serde(default = "default_provider_type")]
    pub provider_type: String,

    /// Base URL for the provider's API
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Number of pooled handles (concurrent outbound calls)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Requests multiplexed over one handle when a batch is fanned out
    #[serde(default = "default_max_concurrent_per_handle")]
    pub max_concurrent_per_handle: usize,

    /// Whether the provider accepts several prompts in one call
    #[serde(default)]
    pub native_batch: bool,

    /// Models advertised by `/v1/models`
    #[serde(default)]
    pub models: Vec<String>,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// How long a caller waits for a free handle before `PoolExhausted`
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum time a batch stays open after its first member joined
    #[serde(default = "default_max_batch_wait_ms")]
    pub max_batch_wait_ms: u64,

    /// First delay applied to a lane after a 429
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on any lane backoff, including a provider `Retry-After`
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// A lane with no traffic for this long is closed and forgotten
    #[serde(default = "default_lane_idle_ms")]
    pub lane_idle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Samples kept per percentile tracker
    #[serde(default = "default_reservoir_capacity")]
    pub reservoir_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_wait_ms: default_max_batch_wait_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            lane_idle_ms: default_lane_idle_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            reservoir_capacity: default_reservoir_capacity(),
        }
    }
}

impl BatchConfig {
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn lane_idle(&self) -> Duration {
        Duration::from_millis(self.lane_idle_ms)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_provider_type() -> String {
    "openai".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_max_concurrent_per_handle() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_max_batch_size() -> usize {
    8
}

fn default_max_batch_wait_ms() -> u64 {
    100
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_lane_idle_ms() -> u64 {
    300_000
}

fn default_reservoir_capacity() -> usize {
    2048
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_gateway::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from YAML text, expanding `${VAR}` references.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Some(port) = env_parse::<u16>("PORT") {
            self.server.port = port;
        }

        if let Ok(verify_ssl_str) = std::env::var("VERIFY_SSL") {
            self.verify_ssl = str_to_bool(&verify_ssl_str);
        }

        if let Some(timeout) = env_parse::<u64>("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = timeout;
        }

        if let Some(size) = env_parse::<usize>("MAX_BATCH_SIZE") {
            self.batch.max_batch_size = size;
        }

        if let Some(wait) = env_parse::<u64>("MAX_BATCH_WAIT_MS") {
            self.batch.max_batch_wait_ms = wait;
        }

        if let Some(acquire) = env_parse::<u64>("POOL_ACQUIRE_TIMEOUT_MS") {
            self.pool.acquire_timeout_ms = acquire;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                bail!("Duplicate provider name: {}", provider.name);
            }
            if provider.pool_size == 0 {
                bail!("Provider '{}' has pool_size 0", provider.name);
            }
            if provider.max_concurrent_per_handle == 0 {
                bail!(
                    "Provider '{}' has max_concurrent_per_handle 0",
                    provider.name
                );
            }
        }

        if self.batch.max_batch_size == 0 {
            bail!("batch.max_batch_size must be at least 1");
        }
        if self.batch.backoff_base_ms > self.batch.backoff_max_ms {
            bail!("batch.backoff_base_ms must not exceed batch.backoff_max_ms");
        }
        if self.batch.lane_idle_ms == 0 {
            bail!("batch.lane_idle_ms must be at least 1");
        }
        if self.metrics.reservoir_capacity == 0 {
            bail!("metrics.reservoir_capacity must be at least 1");
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.acquire_timeout_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-?([^}]*))?\}").expect("env var pattern is valid")
    })
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
