//! The gateway context object.
//!
//! One explicitly constructed [`Gateway`] owns the cache, rate limiter, retry
//! engine and optional batch processor, and wires them around every outbound
//! call: cache hit short-circuits, admission gates the work, the retry engine
//! wraps the remote call, and the result flows back through the same chain.
//! Lifecycle is construct → [`Gateway::start`] → serve →
//! [`Gateway::shutdown`]; there is no implicit global state.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::batch::{
    AddOptions, BatchMetrics, BatchObserver, BatchProcessFn, BatchProcessor, NoopBatchObserver,
};
use crate::cache::{AdaptiveCache, CacheMetrics, CacheWriteOptions};
use crate::config::GatewayConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::observability::{metric_names, MetricsCollector, NoopMetricsCollector};
use crate::resilience::{RateLimiter, RateLimiterMetrics, RetryExecutor};

/// Combined snapshot of every component's metrics, for the external
/// metrics/health collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    /// Rate limiter activity
    pub rate_limiter: RateLimiterMetrics,
    /// Cache activity
    pub cache: CacheMetrics,
    /// Batch activity, when a processor is configured
    pub batch: Option<BatchMetrics>,
}

/// Builder for [`Gateway`].
pub struct GatewayBuilder {
    config: GatewayConfig,
    metrics: Arc<dyn MetricsCollector>,
    batch_process: Option<BatchProcessFn<Value, Value>>,
    batch_observer: Arc<dyn BatchObserver>,
}

impl GatewayBuilder {
    /// Starts a builder from a validated configuration.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(NoopMetricsCollector),
            batch_process: None,
            batch_observer: Arc::new(NoopBatchObserver),
        }
    }

    /// Attaches a metrics collector shared by every component.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Enables batching with the given processor function.
    pub fn batch_processor(mut self, process: BatchProcessFn<Value, Value>) -> Self {
        self.batch_process = Some(process);
        self
    }

    /// Attaches a batch lifecycle observer.
    pub fn batch_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.batch_observer = observer;
        self
    }

    /// Builds the gateway. Background loops are not running until
    /// [`Gateway::start`].
    pub fn build(self) -> Gateway {
        let metrics = self.metrics;
        let batch = self.batch_process.map(|process| {
            BatchProcessor::with_instrumentation(
                self.config.batch.clone(),
                process,
                self.batch_observer,
                metrics.clone(),
            )
        });
        Gateway {
            cache: Arc::new(
                AdaptiveCache::new(self.config.cache.clone()).with_metrics(metrics.clone()),
            ),
            limiter: Arc::new(
                RateLimiter::new(self.config.rate_limit.clone()).with_metrics(metrics.clone()),
            ),
            retry: Arc::new(RetryExecutor::new(self.config.retry.clone()).with_metrics(metrics.clone())),
            batch,
            metrics,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// The resilience and flow-control context for one upstream API.
///
/// All state is per-process and memory-resident; nothing survives a restart.
pub struct Gateway {
    cache: Arc<AdaptiveCache<Value>>,
    limiter: Arc<RateLimiter>,
    retry: Arc<RetryExecutor>,
    batch: Option<BatchProcessor<Value, Value>>,
    metrics: Arc<dyn MetricsCollector>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Creates a gateway with default instrumentation.
    pub fn new(config: GatewayConfig) -> Self {
        GatewayBuilder::new(config).build()
    }

    /// Creates a builder.
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Spawns the queue-drain tick and the cache sweeper. Idempotent.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let limiter = self.limiter.clone();
        let drain_interval = limiter.config().drain_interval;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(drain_interval);
            loop {
                tick.tick().await;
                limiter.tick();
            }
        }));

        let cache = self.cache.clone();
        let sweep_interval = cache.config().sweep_interval;
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            loop {
                tick.tick().await;
                cache.sweep();
            }
        }));

        debug!("Gateway background loops started");
    }

    /// Runs one named operation through admission, retry and metrics.
    ///
    /// This is the single entry point the tool-dispatch layer calls for
    /// non-batched operations.
    pub async fn execute<T, F, Fut>(&self, operation: &str, priority: u8, work: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = GatewayResult<T>> + Send,
        T: Send,
    {
        let started = Instant::now();
        self.metrics.increment_counter(
            metric_names::REQUESTS_TOTAL,
            1,
            &[("operation", operation)],
        );

        let retry = &self.retry;
        let result = self
            .limiter
            .execute(operation, priority, || retry.execute(operation, &work))
            .await;

        self.metrics.record_histogram(
            metric_names::REQUEST_DURATION_MS,
            started.elapsed().as_millis() as f64,
            &[("operation", operation)],
        );
        if let Err(error) = &result {
            self.metrics.increment_counter(
                metric_names::REQUEST_ERRORS,
                1,
                &[("operation", operation), ("kind", error.kind().as_str())],
            );
        }
        result
    }

    /// Like [`Gateway::execute`], but short-circuits through the cache.
    ///
    /// `fingerprint` is the caller-produced cache key, typically a stable
    /// hash of the operation name and its arguments.
    pub async fn cached_execute<F, Fut>(
        &self,
        operation: &str,
        priority: u8,
        fingerprint: &str,
        options: CacheWriteOptions,
        work: F,
    ) -> GatewayResult<Value>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = GatewayResult<Value>> + Send,
    {
        self.cache
            .get_or_set(
                fingerprint,
                || self.execute(operation, priority, work),
                options,
            )
            .await
    }

    /// Submits a payload to the batch processor, for operations the caller
    /// has classified as batchable.
    pub async fn batch_add(
        &self,
        operation: &str,
        payload: Value,
        options: AddOptions,
    ) -> GatewayResult<Value> {
        match &self.batch {
            Some(batch) => batch.add(operation, payload, options).await,
            None => Err(GatewayError::Configuration {
                message: "No batch processor is configured for this gateway".to_string(),
            }),
        }
    }

    /// The shared response cache.
    pub fn cache(&self) -> &AdaptiveCache<Value> {
        &self.cache
    }

    /// The rate limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The retry engine.
    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// The batch processor, when one is configured.
    pub fn batch(&self) -> Option<&BatchProcessor<Value, Value>> {
        self.batch.as_ref()
    }

    /// Takes a combined snapshot of component metrics. Read-only.
    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            rate_limiter: self.limiter.metrics(),
            cache: self.cache.metrics(),
            batch: self.batch.as_ref().map(|batch| batch.metrics()),
        }
    }

    /// Drains and disposes: stops background loops, flushes pending batches,
    /// and rejects everything still queued for admission. Queued callers see
    /// an explicit error, never a hang.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(batch) = &self.batch {
            batch.flush_all();
        }
        let rejected = self.limiter.clear_queue();
        if rejected > 0 {
            info!(rejected, "Rejected queued requests during shutdown");
        }
        debug!("Gateway shut down");
    }
}
