//! Micro-batching of unstructured completions.
//!
//! Requests are grouped into lanes keyed by (provider, model). Each lane is
//! owned by one collector task that alternates between two states:
//!
//! - **collecting**: members arrive over an mpsc channel until the batch
//!   holds `max_batch_size` members or `max_batch_wait` has passed since the
//!   first member joined. On a tie the size trigger wins.
//! - **dispatching**: the closed batch is handed to a spawned dispatch task
//!   and the lane immediately goes back to collecting.
//!
//! A lane that sees no traffic for `lane_idle` closes its channel, removes
//! itself from the lane map and lets its collector exit.
//!
//! Each caller waits on its own oneshot slot, so results are delivered by
//! request identity even when batches complete out of order.

use crate::core::config::BatchConfig;
use crate::core::error::{AppError, Result};
use crate::core::metrics::PhaseDurations;
use crate::services::connection_pool::ConnectionPools;
use crate::services::provider::{Completion, GenerationRequest, ProviderRegistry};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LaneKey {
    provider: String,
    model: String,
}

/// A caller waiting for its slot in a batch.
struct PendingRequest {
    request: GenerationRequest,
    responder: oneshot::Sender<Result<Completion>>,
    enqueued_at: Instant,
}

impl PendingRequest {
    fn is_cancelled(&self) -> bool {
        self.responder.is_closed()
    }

    fn resolve(self, result: Result<Completion>) {
        // A closed receiver means the caller gave up after dispatch; drop the result
        let _ = self.responder.send(result);
    }
}

/// Rate-limit backoff shared by a lane's collector and its dispatch tasks.
#[derive(Debug, Default)]
struct Backoff {
    consecutive_rate_limits: u32,
    resume_at: Option<Instant>,
}

struct Lane {
    id: u64,
    sender: mpsc::UnboundedSender<PendingRequest>,
    task: JoinHandle<()>,
}

struct BatchInner {
    config: BatchConfig,
    request_timeout: Duration,
    acquire_timeout: Duration,
    providers: ProviderRegistry,
    pools: ConnectionPools,
    lanes: DashMap<LaneKey, Lane>,
    next_lane_id: AtomicU64,
    closed: AtomicBool,
}

/// Groups unstructured requests into provider batches.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<BatchInner>,
}

impl BatchProcessor {
    pub fn new(
        config: BatchConfig,
        request_timeout: Duration,
        acquire_timeout: Duration,
        providers: ProviderRegistry,
        pools: ConnectionPools,
    ) -> Self {
        tracing::info!(
            max_batch_size = config.max_batch_size,
            max_batch_wait_ms = config.max_batch_wait_ms,
            "Batch processor initialized"
        );
        Self {
            inner: Arc::new(BatchInner {
                config,
                request_timeout,
                acquire_timeout,
                providers,
                pools,
                lanes: DashMap::new(),
                next_lane_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue `request` in its lane and wait for its result.
    ///
    /// Dropping the returned future before the batch closes removes the
    /// request from the batch without affecting the other members.
    pub async fn submit(&self, request: GenerationRequest) -> Result<Completion> {
        let key = LaneKey {
            provider: request.provider.clone(),
            model: request.model.clone(),
        };
        let (responder, receiver) = oneshot::channel();
        let mut pending = PendingRequest {
            request,
            responder,
            enqueued_at: Instant::now(),
        };

        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(AppError::Internal(
                    "Batch processor is shutting down".to_string(),
                ));
            }
            let (lane_id, sender) = self.lane_sender(&key);
            match sender.send(pending) {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    // The lane went idle between lookup and send
                    self.inner
                        .lanes
                        .remove_if(&key, |_, lane| lane.id == lane_id);
                    pending = returned;
                }
            }
        }

        receiver.await.map_err(|_| AppError::Cancelled)?
    }

    /// Number of open lanes.
    pub fn lane_count(&self) -> usize {
        self.inner.lanes.len()
    }

    /// Stop accepting requests and flush every lane.
    ///
    /// Members already collected are sent in a final dispatch and every
    /// in-flight dispatch is awaited.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<LaneKey> = self
            .inner
            .lanes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let lanes: Vec<Lane> = keys
            .into_iter()
            .filter_map(|key| self.inner.lanes.remove(&key).map(|(_, lane)| lane))
            .collect();

        tracing::info!(lanes = lanes.len(), "Flushing batching lanes");
        for lane in lanes {
            drop(lane.sender);
            if let Err(e) = lane.task.await {
                tracing::error!(error = %e, "Batching lane task failed");
            }
        }
    }

    fn lane_sender(&self, key: &LaneKey) -> (u64, mpsc::UnboundedSender<PendingRequest>) {
        if let Some(lane) = self.inner.lanes.get(key) {
            return (lane.id, lane.sender.clone());
        }

        let lane = self.inner.lanes.entry(key.clone()).or_insert_with(|| {
            let id = self.inner.next_lane_id.fetch_add(1, Ordering::Relaxed);
            let (sender, receiver) = mpsc::unbounded_channel();
            tracing::debug!(
                provider = %key.provider,
                model = %key.model,
                lane_id = id,
                "Opening batching lane"
            );
            let task = tokio::spawn(run_lane(self.inner.clone(), key.clone(), id, receiver));
            Lane { id, sender, task }
        });
        (lane.id, lane.sender.clone())
    }
}

fn lock_backoff(backoff: &Mutex<Backoff>) -> MutexGuard<'_, Backoff> {
    backoff
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exponential delay for the `attempt`-th consecutive rate limit, capped at `max`.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

fn backing_off(backoff: &Mutex<Backoff>) -> Option<Instant> {
    lock_backoff(backoff)
        .resume_at
        .filter(|resume_at| *resume_at > Instant::now())
}

/// Collector task owning one lane.
async fn run_lane(
    inner: Arc<BatchInner>,
    key: LaneKey,
    lane_id: u64,
    mut receiver: mpsc::UnboundedReceiver<PendingRequest>,
) {
    let backoff = Arc::new(Mutex::new(Backoff::default()));
    let max_size = inner.config.max_batch_size.max(1);
    let max_wait = inner.config.max_batch_wait();
    let idle = inner.config.lane_idle();
    let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
    let mut channel_open = true;

    while channel_open {
        let first = match tokio::time::timeout(idle, receiver.recv()).await {
            Ok(Some(first)) => first,
            Ok(None) => break,
            Err(_) => {
                in_flight.retain(|task| !task.is_finished());
                if in_flight.is_empty() && backing_off(&backoff).is_none() {
                    tracing::debug!(
                        provider = %key.provider,
                        model = %key.model,
                        lane_id = lane_id,
                        "Closing idle batching lane"
                    );
                    inner.lanes.remove_if(&key, |_, lane| lane.id == lane_id);
                    // Requests already buffered are still received and dispatched
                    receiver.close();
                }
                continue;
            }
        };
        let deadline = first.enqueued_at + max_wait;
        let mut batch = vec![first];

        loop {
            if batch.len() >= max_size {
                batch.retain(|member| !member.is_cancelled());
                if batch.len() >= max_size {
                    break;
                }
            }
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(member)) => batch.push(member),
                Ok(None) => {
                    channel_open = false;
                    break;
                }
                Err(_) => break,
            }
        }

        let mut batch = prepare_batch(batch, inner.request_timeout);

        // Members keep ageing out while the lane waits out a rate limit
        while !batch.is_empty() {
            let Some(resume_at) = backing_off(&backoff) else {
                break;
            };
            let wake = batch
                .iter()
                .filter_map(|member| member.enqueued_at.checked_add(inner.request_timeout))
                .min()
                .map_or(resume_at, |expiry| expiry.min(resume_at));
            tracing::debug!(
                provider = %key.provider,
                model = %key.model,
                wait_ms = (resume_at - Instant::now()).as_millis() as u64,
                "Delaying batch dispatch after rate limit"
            );
            tokio::time::sleep_until(wake).await;
            batch = prepare_batch(batch, inner.request_timeout);
        }
        if batch.is_empty() {
            continue;
        }

        in_flight.retain(|task| !task.is_finished());
        in_flight.push(tokio::spawn(dispatch(
            inner.clone(),
            key.clone(),
            batch,
            backoff.clone(),
        )));
    }

    for task in in_flight {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Batch dispatch task failed");
        }
    }
    tracing::debug!(provider = %key.provider, model = %key.model, "Batching lane closed");
}

/// Drop cancelled members and time out members older than the request timeout.
fn prepare_batch(batch: Vec<PendingRequest>, request_timeout: Duration) -> Vec<PendingRequest> {
    let now = Instant::now();
    let mut ready = Vec::with_capacity(batch.len());
    for member in batch {
        if member.is_cancelled() {
            continue;
        }
        let age = now.duration_since(member.enqueued_at);
        if age >= request_timeout {
            member.resolve(Err(AppError::ProviderTimeout(format!(
                "Request waited {}ms in the batch queue",
                age.as_millis()
            ))));
            continue;
        }
        ready.push(member);
    }
    ready
}

fn fail_all(batch: Vec<PendingRequest>, error: AppError) {
    for member in batch {
        member.resolve(Err(error.clone()));
    }
}

async fn dispatch(
    inner: Arc<BatchInner>,
    key: LaneKey,
    batch: Vec<PendingRequest>,
    backoff: Arc<Mutex<Backoff>>,
) {
    let batch_size = batch.len();
    let provider = match inner.providers.get(&key.provider) {
        Ok(provider) => provider,
        Err(e) => return fail_all(batch, e),
    };
    let pool = match inner.pools.get(&key.provider) {
        Ok(pool) => pool,
        Err(e) => return fail_all(batch, e),
    };
    let lease = match pool.acquire(inner.acquire_timeout).await {
        Ok(lease) => lease,
        Err(e) => return fail_all(batch, e),
    };

    tracing::debug!(
        provider = %key.provider,
        model = %key.model,
        batch_size = batch_size,
        handle_id = lease.id(),
        native = provider.supports_native_batch(),
        "Dispatching batch"
    );

    let requests: Vec<GenerationRequest> = batch.iter().map(|m| m.request.clone()).collect();
    let started = Instant::now();
    let outcome = match tokio::time::timeout(
        inner.request_timeout,
        provider.complete_batch(&lease, &requests),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(AppError::ProviderTimeout(format!(
            "Batch of {} did not complete within {}s",
            batch_size,
            inner.request_timeout.as_secs()
        ))),
    };
    let elapsed = started.elapsed();

    let healthy = match &outcome {
        Ok(items) => !items
            .iter()
            .any(|item| matches!(item, Err(e) if e.is_transport_failure())),
        Err(e) => !e.is_transport_failure(),
    };
    lease.release(healthy);

    update_backoff(&inner.config, &key, &backoff, &outcome);

    let items = match outcome {
        Ok(items) if items.len() == batch_size => items,
        Ok(items) => {
            tracing::error!(
                provider = %key.provider,
                model = %key.model,
                expected = batch_size,
                received = items.len(),
                "Provider returned wrong number of batch results"
            );
            return fail_all(
                batch,
                AppError::ProviderError {
                    status: None,
                    message: format!(
                        "Provider returned {} results for a batch of {}",
                        items.len(),
                        batch_size
                    ),
                },
            );
        }
        Err(e) => {
            tracing::warn!(
                provider = %key.provider,
                model = %key.model,
                batch_size = batch_size,
                error = %e,
                "Batch failed"
            );
            return fail_all(batch, e);
        }
    };

    let shared = PhaseDurations::from_total(elapsed);
    for (member, item) in batch.into_iter().zip(items) {
        let item = item.map(|mut completion| {
            if completion.phases.is_none() {
                completion.phases =
                    Some(shared.with_derived_per_token(completion.usage.output_tokens));
            }
            completion
        });
        member.resolve(item);
    }
}

fn update_backoff(
    config: &BatchConfig,
    key: &LaneKey,
    backoff: &Mutex<Backoff>,
    outcome: &Result<Vec<Result<Completion>>>,
) {
    let rate_limit = match outcome {
        Err(AppError::RateLimited { retry_after, .. }) => Some(*retry_after),
        Ok(items) => items.iter().find_map(|item| match item {
            Err(AppError::RateLimited { retry_after, .. }) => Some(*retry_after),
            _ => None,
        }),
        Err(_) => None,
    };

    let mut state = lock_backoff(backoff);
    match rate_limit {
        Some(retry_after) => {
            state.consecutive_rate_limits = state.consecutive_rate_limits.saturating_add(1);
            let delay = backoff_delay(
                config.backoff_base(),
                config.backoff_max(),
                state.consecutive_rate_limits,
            );
            let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.8..=1.0));
            let wait = retry_after
                .map_or(jittered, |after| after.max(jittered))
                .min(config.backoff_max());
            state.resume_at = Instant::now().checked_add(wait);
            tracing::warn!(
                provider = %key.provider,
                model = %key.model,
                consecutive = state.consecutive_rate_limits,
                retry_after_ms = retry_after.map(|after| after.as_millis() as u64),
                backoff_ms = wait.as_millis() as u64,
                "Rate limited, backing off next batch"
            );
        }
        None => {
            state.consecutive_rate_limits = 0;
            state.resume_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ProviderConfig;
    use crate::services::connection_pool::{ConnectionPool, ProviderHandle};
    use crate::services::provider::{LlmProvider, ModelInfo, TokenUsage};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Echoes prompts back and records every batch it receives.
    #[derive(Default)]
    struct EchoProvider {
        batches: Mutex<Vec<Vec<String>>>,
        fail_with: Mutex<Option<AppError>>,
        calls: AtomicUsize,
    }

    impl EchoProvider {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn models(&self) -> Vec<ModelInfo> {
            Vec::new()
        }

        fn supports_native_batch(&self) -> bool {
            true
        }

        async fn complete(
            &self,
            _handle: &ProviderHandle,
            request: &GenerationRequest,
        ) -> Result<Completion> {
            Ok(Completion {
                id: "single".into(),
                text: request.prompt.to_uppercase(),
                usage: TokenUsage::new(1, 1),
                phases: None,
            })
        }

        async fn complete_batch(
            &self,
            _handle: &ProviderHandle,
            requests: &[GenerationRequest],
        ) -> Result<Vec<Result<Completion>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .push(requests.iter().map(|r| r.prompt.clone()).collect());
            tokio::time::sleep(Duration::from_millis(5)).await;

            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            Ok(requests
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    Ok(Completion {
                        id: format!("b-{}", i),
                        text: r.prompt.to_uppercase(),
                        usage: TokenUsage::new(r.prompt.len() as u64, 2),
                        phases: None,
                    })
                })
                .collect())
        }
    }

    fn batch_config(size: usize, wait_ms: u64) -> BatchConfig {
        BatchConfig {
            max_batch_size: size,
            max_batch_wait_ms: wait_ms,
            backoff_base_ms: 1_000,
            backoff_max_ms: 8_000,
            lane_idle_ms: 60_000,
        }
    }

    fn processor(provider: Arc<EchoProvider>, size: usize, wait_ms: u64) -> BatchProcessor {
        processor_with(provider, batch_config(size, wait_ms), Duration::from_secs(30))
    }

    fn processor_with(
        provider: Arc<EchoProvider>,
        config: BatchConfig,
        request_timeout: Duration,
    ) -> BatchProcessor {
        let mut providers = ProviderRegistry::new();
        providers.insert(provider);

        let mut pools = ConnectionPools::default();
        pools.insert(
            ConnectionPool::new(
                &ProviderConfig {
                    name: "mock".into(),
                    provider_type: "openai".into(),
                    api_base: "http://localhost".into(),
                    api_key: String::new(),
                    pool_size: 2,
                    max_concurrent_per_handle: 4,
                    native_batch: true,
                    models: vec![],
                },
                Duration::from_secs(30),
                true,
            )
            .unwrap(),
        );

        BatchProcessor::new(
            config,
            request_timeout,
            Duration::from_secs(1),
            providers,
            pools,
        )
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest::new("mock", "m1", prompt)
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(3);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, max, 4), max);
        assert_eq!(backoff_delay(base, max, 64), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_dispatches_together() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 4, 50);

        let started = Instant::now();
        let results = futures::future::join_all(
            ["a", "b", "c", "d"].map(|p| batcher.submit(request(p))),
        )
        .await;

        assert_eq!(provider.batch_sizes(), vec![4]);
        let texts: Vec<String> = results.into_iter().map(|r| r.unwrap().text).collect();
        assert_eq!(texts, vec!["A", "B", "C", "D"]);
        // Size trigger fired well before the wait trigger
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_request_waits_for_timer() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 4, 50);

        let started = Instant::now();
        let completion = batcher.submit(request("solo")).await.unwrap();

        assert_eq!(completion.text, "SOLO");
        assert_eq!(provider.batch_sizes(), vec![1]);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_starts_next_batch() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 2, 50);

        let results =
            futures::future::join_all(["a", "b", "c"].map(|p| batcher.submit(request(p)))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(provider.batch_sizes(), vec![2, 1]);
        // Arrival order is preserved across batches
        assert_eq!(
            *provider.batches.lock().unwrap(),
            vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_lanes_per_model() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 4, 20);

        let a = batcher.submit(request("x"));
        let b = batcher.submit(GenerationRequest::new("mock", "m2", "y"));
        let (a, b) = tokio::join!(a, b);

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(batcher.lane_count(), 2);
        let mut sizes = provider.batch_sizes();
        sizes.sort();
        assert_eq!(sizes, vec![1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wholesale_failure_reaches_every_member() {
        let provider = Arc::new(EchoProvider::default());
        *provider.fail_with.lock().unwrap() = Some(AppError::from_status(503, "down"));
        let batcher = processor(provider.clone(), 3, 20);

        let results =
            futures::future::join_all(["a", "b", "c"].map(|p| batcher.submit(request(p)))).await;

        for result in results {
            assert_matches!(result, Err(AppError::ProviderError { status: Some(503), .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_member_removed_before_dispatch() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 4, 50);

        let keep_a = tokio::spawn({
            let batcher = batcher.clone();
            async move { batcher.submit(request("a")).await }
        });
        let cancelled = tokio::spawn({
            let batcher = batcher.clone();
            async move { batcher.submit(request("gone")).await }
        });
        let keep_b = tokio::spawn({
            let batcher = batcher.clone();
            async move { batcher.submit(request("b")).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancelled.abort();

        assert_eq!(keep_a.await.unwrap().unwrap().text, "A");
        assert_eq!(keep_b.await.unwrap().unwrap().text, "B");
        assert_eq!(
            *provider.batches.lock().unwrap(),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_timing_filled_in() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider, 1, 10);

        let completion = batcher.submit(request("abc")).await.unwrap();
        let phases = completion.phases.unwrap();
        assert!(phases.total >= Duration::from_millis(5));
        assert!(phases.time_per_token.is_some());
        assert_eq!(completion.usage, TokenUsage::new(3, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delays_next_batch() {
        let provider = Arc::new(EchoProvider::default());
        *provider.fail_with.lock().unwrap() = Some(AppError::RateLimited {
            message: "slow down".into(),
            retry_after: None,
        });
        let batcher = processor(provider.clone(), 1, 10);

        let first = batcher.submit(request("a")).await;
        assert_matches!(first, Err(AppError::RateLimited { .. }));

        *provider.fail_with.lock().unwrap() = None;
        let started = Instant::now();
        let second = batcher.submit(request("b")).await;
        assert!(second.is_ok());
        // backoff_base is 1s with at most 20% jitter taken off
        assert!(started.elapsed() >= Duration::from_millis(800));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_retry_after_is_capped_by_backoff_max() {
        let provider = Arc::new(EchoProvider::default());
        *provider.fail_with.lock().unwrap() = Some(AppError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(u64::MAX)),
        });
        let batcher = processor(provider.clone(), 1, 10);

        let first = batcher.submit(request("a")).await;
        assert_matches!(first, Err(AppError::RateLimited { .. }));

        *provider.fail_with.lock().unwrap() = None;
        let started = Instant::now();
        let second = batcher.submit(request("b")).await;

        assert_eq!(second.unwrap().text, "B");
        // backoff_max is 8s
        assert!(started.elapsed() >= Duration::from_secs(7));
        assert!(started.elapsed() < Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_expires_while_lane_backs_off() {
        let provider = Arc::new(EchoProvider::default());
        *provider.fail_with.lock().unwrap() = Some(AppError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(3600)),
        });
        let batcher = processor_with(provider.clone(), batch_config(1, 10), Duration::from_secs(2));

        let first = batcher.submit(request("a")).await;
        assert_matches!(first, Err(AppError::RateLimited { .. }));

        *provider.fail_with.lock().unwrap() = None;
        let started = Instant::now();
        let second = batcher.submit(request("b")).await;

        assert_matches!(second, Err(AppError::ProviderTimeout(_)));
        // Resolved at its own deadline, not after the 8s backoff
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_lanes_are_reclaimed() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 1, 10);

        let models: Vec<String> = (0..20).map(|i| format!("model-{}", i)).collect();
        let results = futures::future::join_all(
            models
                .iter()
                .map(|model| batcher.submit(GenerationRequest::new("mock", model.as_str(), "x"))),
        )
        .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(batcher.lane_count(), 20);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(batcher.lane_count(), 0);

        // A later request opens a fresh lane for the same key
        assert_eq!(batcher.submit(request("again")).await.unwrap().text, "AGAIN");
        assert_eq!(batcher.lane_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_member_times_out() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 4, 10);
        let (tx, rx) = oneshot::channel();
        let stale = PendingRequest {
            request: request("old"),
            responder: tx,
            enqueued_at: Instant::now(),
        };

        tokio::time::advance(Duration::from_secs(31)).await;
        let ready = prepare_batch(vec![stale], Duration::from_secs(30));

        assert!(ready.is_empty());
        assert_matches!(rx.await.unwrap(), Err(AppError::ProviderTimeout(_)));
        assert!(provider.batch_sizes().is_empty());
        drop(batcher);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_collected_members() {
        let provider = Arc::new(EchoProvider::default());
        let batcher = processor(provider.clone(), 8, 60_000);

        let pending = tokio::spawn({
            let batcher = batcher.clone();
            async move { batcher.submit(request("late")).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        batcher.shutdown().await;
        assert_eq!(pending.await.unwrap().unwrap().text, "LATE");
        assert_eq!(provider.batch_sizes(), vec![1]);

        assert_matches!(
            batcher.submit(request("after")).await,
            Err(AppError::Internal(_))
        );
    }
}
