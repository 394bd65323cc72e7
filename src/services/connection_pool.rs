//! Bounded per-provider pools of reusable provider handles.
//!
//! A [`ConnectionPool`] owns `pool_size` [`ProviderHandle`]s. Callers borrow
//! one with [`ConnectionPool::acquire`] and give it back through the returned
//! [`PooledHandle`] guard. Waiters are served FIFO by the underlying tokio
//! semaphore. A handle released as unhealthy is destroyed and replaced in the
//! background, so the pool returns to full capacity without ever handing the
//! broken handle out again.

use crate::core::config::{AppConfig, ProviderConfig};
use crate::core::error::{AppError, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A reusable client bound to one provider.
///
/// Each handle owns its own `reqwest::Client`, and therefore its own
/// keep-alive connections, so a discarded handle takes its sockets with it.
pub struct ProviderHandle {
    id: u64,
    provider: Arc<str>,
    base_url: Arc<str>,
    api_key: Arc<str>,
    client: reqwest::Client,
    max_concurrency: usize,
    created_at: Instant,
}

impl ProviderHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Requests this handle may multiplex concurrently.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

/// Builds handles for one provider.
struct HandleFactory {
    provider: Arc<str>,
    base_url: Arc<str>,
    api_key: Arc<str>,
    max_concurrency: usize,
    request_timeout: Duration,
    verify_ssl: bool,
    next_id: AtomicU64,
}

impl HandleFactory {
    fn create(&self) -> Result<ProviderHandle> {
        let client = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .build()
            .map_err(|e| {
                AppError::Internal(format!(
                    "Failed to build HTTP client for provider '{}': {}",
                    self.provider, e
                ))
            })?;

        Ok(ProviderHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            provider: self.provider.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            client,
            max_concurrency: self.max_concurrency,
            created_at: Instant::now(),
        })
    }
}

/// Point-in-time pool counters, exposed on the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub provider: String,
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created_total: u64,
    pub discarded_total: u64,
}

struct PoolInner {
    provider: String,
    capacity: usize,
    /// One permit per idle handle
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<ProviderHandle>>,
    factory: HandleFactory,
    in_use: AtomicUsize,
    created_total: AtomicU64,
    discarded_total: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<ProviderHandle>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a replacement handle and make it available to waiters.
    fn replenish(&self) {
        match self.factory.create() {
            Ok(handle) => {
                tracing::debug!(
                    provider = %self.provider,
                    handle_id = handle.id(),
                    "Replenished pool handle"
                );
                self.created_total.fetch_add(1, Ordering::Relaxed);
                self.idle().push_back(handle);
                self.semaphore.add_permits(1);
            }
            Err(e) => {
                tracing::error!(
                    provider = %self.provider,
                    error = %e,
                    "Failed to replenish pool handle, pool is running below capacity"
                );
            }
        }
    }
}

/// Bounded pool of handles for one provider.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("provider", &self.inner.provider)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.inner.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Build a pool with `pool_size` ready handles.
    pub fn new(config: &ProviderConfig, request_timeout: Duration, verify_ssl: bool) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(AppError::InvalidRequest(format!(
                "Provider '{}' has pool_size 0",
                config.name
            )));
        }

        let factory = HandleFactory {
            provider: Arc::from(config.name.as_str()),
            base_url: Arc::from(config.api_base.trim_end_matches('/')),
            api_key: Arc::from(config.api_key.as_str()),
            max_concurrency: config.max_concurrent_per_handle.max(1),
            request_timeout,
            verify_ssl,
            next_id: AtomicU64::new(0),
        };

        let handles = (0..config.pool_size)
            .map(|_| factory.create())
            .collect::<Result<VecDeque<_>>>()?;

        tracing::info!(
            provider = %config.name,
            capacity = config.pool_size,
            max_concurrent_per_handle = factory.max_concurrency,
            "Connection pool initialized"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                provider: config.name.clone(),
                capacity: config.pool_size,
                semaphore: Arc::new(Semaphore::new(config.pool_size)),
                idle: Mutex::new(handles),
                factory,
                in_use: AtomicUsize::new(0),
                created_total: AtomicU64::new(config.pool_size as u64),
                discarded_total: AtomicU64::new(0),
            }),
        })
    }

    pub fn provider(&self) -> &str {
        &self.inner.provider
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Borrow a handle, waiting up to `timeout` for one to become free.
    ///
    /// Fails with [`AppError::PoolExhausted`] when the wait times out.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledHandle> {
        let started = Instant::now();
        let permit =
            match tokio::time::timeout(timeout, self.inner.semaphore.clone().acquire_owned()).await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(AppError::Internal(format!(
                        "Connection pool for '{}' is closed",
                        self.inner.provider
                    )))
                }
                Err(_) => {
                    tracing::warn!(
                        provider = %self.inner.provider,
                        timeout_ms = timeout.as_millis() as u64,
                        capacity = self.inner.capacity,
                        "Connection pool exhausted"
                    );
                    return Err(AppError::PoolExhausted {
                        provider: self.inner.provider.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            };

        // A permit is only ever issued after its handle was pushed back
        let handle = match self.inner.idle().pop_front() {
            Some(handle) => handle,
            None => self.inner.factory.create()?,
        };
        self.inner.in_use.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            provider = %self.inner.provider,
            handle_id = handle.id(),
            waited_ms = started.elapsed().as_millis() as u64,
            "Acquired pool handle"
        );

        Ok(PooledHandle {
            handle: Some(handle),
            permit: Some(permit),
            pool: self.inner.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            provider: self.inner.provider.clone(),
            capacity: self.inner.capacity,
            idle: self.inner.idle().len(),
            in_use: self.inner.in_use.load(Ordering::Relaxed),
            created_total: self.inner.created_total.load(Ordering::Relaxed),
            discarded_total: self.inner.discarded_total.load(Ordering::Relaxed),
        }
    }
}

/// A borrowed handle. Must go back through [`PooledHandle::release`];
/// dropping it without releasing counts as a healthy release.
pub struct PooledHandle {
    handle: Option<ProviderHandle>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledHandle {
    /// Return the handle. `healthy=false` destroys it and schedules a replacement.
    pub fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn finish(&mut self, healthy: bool) {
        let (Some(handle), Some(permit)) = (self.handle.take(), self.permit.take()) else {
            return;
        };
        self.pool.in_use.fetch_sub(1, Ordering::Relaxed);

        if healthy {
            self.pool.idle().push_back(handle);
            drop(permit);
            return;
        }

        tracing::warn!(
            provider = %self.pool.provider,
            handle_id = handle.id(),
            age_ms = handle.age().as_millis() as u64,
            "Discarding unhealthy pool handle"
        );
        self.pool.discarded_total.fetch_add(1, Ordering::Relaxed);
        drop(handle);
        // The replacement adds its own permit once it is in the idle queue
        permit.forget();

        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                // Building a client loads TLS roots, keep it off the async workers
                runtime.spawn_blocking(move || pool.replenish());
            }
            Err(_) => pool.replenish(),
        }
    }
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("provider", &self.pool.provider)
            .field("handle_id", &self.handle.as_ref().map(ProviderHandle::id))
            .finish_non_exhaustive()
    }
}

impl Deref for PooledHandle {
    type Target = ProviderHandle;

    fn deref(&self) -> &ProviderHandle {
        self.handle
            .as_ref()
            .expect("pooled handle accessed after release")
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// All provider pools, keyed by provider name.
#[derive(Clone, Default)]
pub struct ConnectionPools {
    pools: HashMap<String, ConnectionPool>,
}

impl ConnectionPools {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut pools = HashMap::with_capacity(config.providers.len());
        for provider in &config.providers {
            let pool = ConnectionPool::new(provider, config.request_timeout(), config.verify_ssl)?;
            pools.insert(provider.name.clone(), pool);
        }
        Ok(Self { pools })
    }

    pub fn insert(&mut self, pool: ConnectionPool) {
        self.pools.insert(pool.provider().to_string(), pool);
    }

    pub fn get(&self, provider: &str) -> Result<&ConnectionPool> {
        self.pools
            .get(provider)
            .ok_or_else(|| AppError::InvalidRequest(format!("Unknown provider: {}", provider)))
    }

    /// Stats for every pool, sorted by provider name.
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.values().map(ConnectionPool::stats).collect();
        stats.sort_by(|a, b| a.provider.cmp(&b.provider));
        stats
    }
}
