//! LLM Gateway - Main entry point
//!
//! Loads configuration, builds the provider pools, batching lanes and
//! orchestrator, then serves the HTTP API until Ctrl-C.

use anyhow::{Context, Result};
use llm_gateway::{
    api::{router, AppState},
    core::{init_tracing, AppConfig, MetricsCollector},
    services::{ProviderRegistry, RequestOrchestrator},
    validation::InMemorySchemaRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .or_else(detect_cpu_limit)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(worker_threads))
}

async fn async_main(worker_threads: usize) -> Result<()> {
    init_tracing();
    tracing::info!(worker_threads = worker_threads, "Tokio runtime started");

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = AppConfig::load(&config_path)?;

    tracing::info!(
        config_path = %config_path,
        providers = config.providers.len(),
        max_batch_size = config.batch.max_batch_size,
        max_batch_wait_ms = config.batch.max_batch_wait_ms,
        auth_enabled = !config.api_keys.is_empty(),
        "Configuration loaded"
    );

    let providers = ProviderRegistry::from_config(&config)?;
    let schemas = Arc::new(InMemorySchemaRegistry::new());
    let metrics = Arc::new(MetricsCollector::new(config.metrics.reservoir_capacity));
    let orchestrator = Arc::new(RequestOrchestrator::from_config(
        &config,
        providers,
        schemas.clone(),
        metrics,
    )?);

    let state = Arc::new(AppState::new(
        orchestrator.clone(),
        schemas,
        config.api_keys.clone(),
    ));

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| "Invalid server host/port")?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, flushing batching lanes");
    orchestrator.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// CPU quota from cgroup v2, falling back to v1.
fn detect_cpu_limit() -> Option<usize> {
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 && period > 0 {
                    return Some(((quota as f64 / period as f64).ceil() as usize).max(1));
                }
            }
        }
    }

    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 && period > 0 {
        Some(((quota as f64 / period as f64).ceil() as usize).max(1))
    } else {
        None
    }
}
