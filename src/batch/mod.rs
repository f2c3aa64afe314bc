//! Priority batch processor.
//!
//! Items submitted under the same operation key accumulate in a pending
//! group; a group is dispatched when it reaches `max_batch_size` or when
//! `max_wait` has elapsed since its first item, whichever comes first. The
//! processor function receives every payload in the group and must return a
//! same-length, same-order result list; a processor failure rejects the whole
//! group. At most `max_concurrency` groups are in flight at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::{GatewayError, GatewayResult};
use crate::observability::{metric_names, MetricsCollector, NoopMetricsCollector};
use crate::resilience::with_timeout;

/// Configuration for the batch processor.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Group size that triggers an immediate dispatch
    pub max_batch_size: usize,
    /// Longest a group waits after its first item before dispatching
    pub max_wait: Duration,
    /// Maximum groups in flight at once
    pub max_concurrency: usize,
    /// Group-level retries after a processor failure
    pub max_retries: u32,
    /// Backoff base for group retries
    pub retry_base_delay: Duration,
    /// Backoff ceiling for group retries
    pub retry_max_delay: Duration,
    /// Multiplier applied per group retry
    pub backoff_multiplier: f64,
    /// Order pending items by priority within a group
    pub enable_prioritization: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait: Duration::from_millis(100),
            max_concurrency: 4,
            max_retries: 0,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            enable_prioritization: true,
        }
    }
}

impl BatchConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the size that triggers an immediate dispatch.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the time-based flush bound.
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Sets the dispatch concurrency cap.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Sets the group-level retry budget.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Enables or disables in-group priority ordering.
    pub fn enable_prioritization(mut self, enable: bool) -> Self {
        self.enable_prioritization = enable;
        self
    }
}

/// Per-item submission options.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// Higher values are placed ahead within the pending group
    pub priority: u8,
    /// Deadline for this item's result, measured from submission
    pub timeout: Option<Duration>,
}

impl AddOptions {
    /// Options with priority 0 and no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the item priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the item deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The function a group is dispatched to.
///
/// Receives the payloads of every item in the group, in group order, and must
/// return one result per payload in the same order.
pub type BatchProcessFn<P, R> =
    Arc<dyn Fn(Vec<P>) -> BoxFuture<'static, GatewayResult<Vec<R>>> + Send + Sync>;

/// Fire-and-forget lifecycle events.
///
/// Implementations must not panic; nothing an observer does can fail a batch.
#[cfg_attr(test, mockall::automock)]
pub trait BatchObserver: Send + Sync {
    /// A group was processed and every item resolved.
    fn on_batch_processed(&self, operation: &str, size: usize, elapsed: Duration);

    /// A group failed after exhausting its retries; every item was rejected.
    fn on_batch_error(&self, operation: &str, size: usize, error: &GatewayError);
}

/// Observer that ignores every event.
pub struct NoopBatchObserver;

impl BatchObserver for NoopBatchObserver {
    fn on_batch_processed(&self, _operation: &str, _size: usize, _elapsed: Duration) {}
    fn on_batch_error(&self, _operation: &str, _size: usize, _error: &GatewayError) {}
}

/// Read-only snapshot of batch activity.
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetrics {
    /// Items accepted by `add`
    pub items_submitted: u64,
    /// Groups handed to the processor function
    pub groups_dispatched: u64,
    /// Groups that failed after all retries
    pub groups_failed: u64,
    /// Items currently waiting in pending groups
    pub pending_items: usize,
}

struct BatchItem<P, R> {
    payload: P,
    priority: u8,
    responder: oneshot::Sender<GatewayResult<R>>,
}

struct PendingGroup<P, R> {
    items: Vec<BatchItem<P, R>>,
    opened_at: Instant,
    generation: u64,
}

struct Inner<P, R> {
    config: BatchConfig,
    process: BatchProcessFn<P, R>,
    groups: Mutex<HashMap<String, PendingGroup<P, R>>>,
    permits: Arc<Semaphore>,
    observer: Arc<dyn BatchObserver>,
    metrics: Arc<dyn MetricsCollector>,
    generation: AtomicU64,
    items_submitted: AtomicU64,
    groups_dispatched: AtomicU64,
    groups_failed: AtomicU64,
}

/// Accumulates individual work items into groups and fans results back to
/// each item's caller.
pub struct BatchProcessor<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> Clone for BatchProcessor<P, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P, R> BatchProcessor<P, R>
where
    P: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Creates a processor with no observer and no metrics sink.
    pub fn new(config: BatchConfig, process: BatchProcessFn<P, R>) -> Self {
        Self::with_instrumentation(
            config,
            process,
            Arc::new(NoopBatchObserver),
            Arc::new(NoopMetricsCollector),
        )
    }

    /// Creates a processor with an observer and metrics collector attached.
    pub fn with_instrumentation(
        config: BatchConfig,
        process: BatchProcessFn<P, R>,
        observer: Arc<dyn BatchObserver>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                process,
                groups: Mutex::new(HashMap::new()),
                permits,
                observer,
                metrics,
                generation: AtomicU64::new(0),
                items_submitted: AtomicU64::new(0),
                groups_dispatched: AtomicU64::new(0),
                groups_failed: AtomicU64::new(0),
            }),
        }
    }

    /// Submits one item and resolves with its positional result once the
    /// group it joined settles.
    pub async fn add(&self, operation: &str, payload: P, options: AddOptions) -> GatewayResult<R> {
        let receiver = self.submit(operation, payload, options.priority);
        let settled = async move {
            match receiver.await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Internal {
                    message: "Batch item dropped without resolution".to_string(),
                }),
            }
        };
        match options.timeout {
            Some(limit) => with_timeout(limit, operation, settled).await,
            None => settled.await,
        }
    }

    /// Dispatches every pending group immediately, regardless of size or age.
    /// Used on shutdown so no accepted item is left behind.
    pub fn flush_all(&self) {
        let drained: Vec<(String, Vec<BatchItem<P, R>>)> = {
            let mut groups = self.inner.groups.lock();
            groups
                .drain()
                .map(|(operation, group)| (operation, group.items))
                .collect()
        };
        for (operation, items) in drained {
            if !items.is_empty() {
                debug!(operation = %operation, size = items.len(), "Flushing batch on demand");
                self.spawn_dispatch(operation, items);
            }
        }
    }

    /// Number of items currently waiting in pending groups.
    pub fn pending_items(&self) -> usize {
        self.inner
            .groups
            .lock()
            .values()
            .map(|group| group.items.len())
            .sum()
    }

    /// Takes a snapshot of batch activity.
    pub fn metrics(&self) -> BatchMetrics {
        BatchMetrics {
            items_submitted: self.inner.items_submitted.load(Ordering::Relaxed),
            groups_dispatched: self.inner.groups_dispatched.load(Ordering::Relaxed),
            groups_failed: self.inner.groups_failed.load(Ordering::Relaxed),
            pending_items: self.pending_items(),
        }
    }

    fn submit(&self, operation: &str, payload: P, priority: u8) -> oneshot::Receiver<GatewayResult<R>> {
        let (responder, receiver) = oneshot::channel();
        self.inner.items_submitted.fetch_add(1, Ordering::Relaxed);
        let item = BatchItem {
            payload,
            priority,
            responder,
        };

        // Membership mutation and the size check happen in one critical
        // section, so exactly one submitter observes the flush threshold.
        let mut timer: Option<u64> = None;
        let ready: Option<Vec<BatchItem<P, R>>> = {
            let mut groups = self.inner.groups.lock();
            let group = groups.entry(operation.to_string()).or_insert_with(|| {
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                PendingGroup {
                    items: Vec::new(),
                    opened_at: Instant::now(),
                    generation,
                }
            });
            let newly_opened = group.items.is_empty();
            if newly_opened {
                timer = Some(group.generation);
            }

            if self.inner.config.enable_prioritization {
                let position = group
                    .items
                    .partition_point(|existing| existing.priority >= item.priority);
                group.items.insert(position, item);
            } else {
                group.items.push(item);
            }

            if group.items.len() >= self.inner.config.max_batch_size {
                groups.remove(operation).map(|group| group.items)
            } else {
                None
            }
        };

        if let Some(items) = ready {
            debug!(operation, size = items.len(), "Flushing batch at size limit");
            self.spawn_dispatch(operation.to_string(), items);
        } else if let Some(generation) = timer {
            let processor = self.clone();
            let operation = operation.to_string();
            let max_wait = self.inner.config.max_wait;
            tokio::spawn(async move {
                sleep(max_wait).await;
                processor.flush_due(&operation, generation);
            });
        }

        receiver
    }

    // Time-based flush; a generation mismatch means the group already left by
    // the size path and this timer is stale.
    fn flush_due(&self, operation: &str, generation: u64) {
        let flushed = {
            let mut groups = self.inner.groups.lock();
            let due = groups
                .get(operation)
                .map(|group| group.generation == generation)
                .unwrap_or(false);
            if due {
                groups
                    .remove(operation)
                    .map(|group| (group.items, group.opened_at.elapsed()))
            } else {
                None
            }
        };
        if let Some((items, waited)) = flushed {
            if !items.is_empty() {
                debug!(
                    operation,
                    size = items.len(),
                    waited_ms = waited.as_millis() as u64,
                    "Flushing batch at wait limit"
                );
                self.spawn_dispatch(operation.to_string(), items);
            }
        }
    }

    fn spawn_dispatch(&self, operation: String, items: Vec<BatchItem<P, R>>) {
        let processor = self.clone();
        tokio::spawn(async move {
            processor.dispatch(operation, items).await;
        });
    }

    async fn dispatch(&self, operation: String, items: Vec<BatchItem<P, R>>) {
        let _permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("batch semaphore is never closed");

        self.inner.groups_dispatched.fetch_add(1, Ordering::Relaxed);
        let payloads: Vec<P> = items.iter().map(|item| item.payload.clone()).collect();
        let size = items.len();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            attempt += 1;
            match (self.inner.process)(payloads.clone()).await {
                Ok(results) => break Ok(results),
                Err(error) if attempt <= self.inner.config.max_retries => {
                    let delay = self.retry_delay(attempt);
                    warn!(
                        operation = %operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Batch dispatch failed; retrying group"
                    );
                    sleep(delay).await;
                }
                Err(error) => break Err(error),
            }
        };

        let failure = match outcome {
            Ok(results) => {
                if results.len() == size {
                    let elapsed = started.elapsed();
                    self.inner.metrics.increment_counter(
                        metric_names::BATCH_GROUPS,
                        1,
                        &[("operation", operation.as_str())],
                    );
                    // Events fire before settlement so observers see a batch
                    // before any caller resumes; they never fail the batch.
                    self.inner
                        .observer
                        .on_batch_processed(&operation, size, elapsed);
                    debug!(
                        operation = %operation,
                        size,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Batch processed"
                    );
                    for (item, result) in items.into_iter().zip(results) {
                        let _ = item.responder.send(Ok(result));
                    }
                    return;
                }
                GatewayError::Internal {
                    message: format!(
                        "Batch processor returned {} results for {} items",
                        results.len(),
                        size
                    ),
                }
            }
            Err(error) => error,
        };

        self.inner.groups_failed.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.increment_counter(
            metric_names::BATCH_FAILURES,
            1,
            &[
                ("operation", operation.as_str()),
                ("kind", failure.kind().as_str()),
            ],
        );
        self.inner.observer.on_batch_error(&operation, size, &failure);
        warn!(operation = %operation, size, error = %failure, "Batch group failed");
        for item in items {
            let _ = item.responder.send(Err(failure.clone()));
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.inner.config.retry_base_delay.as_millis() as f64
            * self
                .inner
                .config
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.inner.config.retry_max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
