//! Multi-strategy rate limiter with priority queueing.
//!
//! Admission is decided by one of three interchangeable strategies (token
//! bucket, sliding window, adaptive-feedback), selected at construction and
//! swappable at runtime. Work that cannot be admitted immediately waits in a
//! priority queue; [`RateLimiter::tick`] drains the queue as capacity
//! refills. Admission check-and-consume happens in a single synchronous
//! critical section, so concurrent submissions on the same runtime cannot
//! double-spend capacity.

use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{GatewayError, GatewayResult};
use crate::observability::{metric_names, MetricsCollector, NoopMetricsCollector};

/// Token bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    /// Bucket capacity; also the initial fill
    pub max_tokens: u32,
    /// Tokens restored per second
    pub refill_rate: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 50,
            refill_rate: 10.0,
        }
    }
}

/// Sliding window parameters.
#[derive(Debug, Clone, Copy)]
pub struct SlidingWindowConfig {
    /// Length of the trailing window
    pub window: Duration,
    /// Maximum admissions inside the window
    pub max_requests: usize,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Adaptive-feedback parameters: a token bucket whose refill rate is
/// periodically rewritten from observed response times.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    /// The underlying bucket (its refill rate is the starting rate)
    pub bucket: TokenBucketConfig,
    /// Response-time target the feedback loop steers toward
    pub target_response_time: Duration,
    /// Fractional rate change per adjustment
    pub adjustment_factor: f64,
    /// Minimum time between adjustments
    pub adjust_interval: Duration,
    /// How many recent response times are kept
    pub sample_capacity: usize,
    /// Floor for the refill rate, tokens per second
    pub min_rate: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            bucket: TokenBucketConfig::default(),
            target_response_time: Duration::from_secs(1),
            adjustment_factor: 0.1,
            adjust_interval: Duration::from_secs(10),
            sample_capacity: 100,
            min_rate: 1.0,
        }
    }
}

/// Admission strategy, chosen at construction.
///
/// A closed set: new strategies are added here, not by external
/// implementations.
#[derive(Debug, Clone)]
pub enum RateLimitStrategy {
    /// Continuous refill up to a capacity; each admission costs one token
    TokenBucket(TokenBucketConfig),
    /// At most N admissions within the trailing window `(now-window, now]`
    SlidingWindow(SlidingWindowConfig),
    /// Token bucket with response-time feedback on the refill rate
    Adaptive(AdaptiveConfig),
}

impl Default for RateLimitStrategy {
    fn default() -> Self {
        RateLimitStrategy::TokenBucket(TokenBucketConfig::default())
    }
}

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Admission strategy
    pub strategy: RateLimitStrategy,
    /// Pending-queue bound; submissions beyond it are rejected outright
    pub max_queue_size: usize,
    /// Times a failed-but-retryable request is resubmitted for admission.
    ///
    /// Zero by default: the gateway `execute` path already wraps work in the
    /// retry engine inside a single admission, and stacking both would
    /// multiply attempts. Standalone limiter users can raise it.
    pub requeue_retries: u32,
    /// Backoff base for resubmission
    pub requeue_base_delay: Duration,
    /// Backoff ceiling for resubmission
    pub requeue_max_delay: Duration,
    /// How often the owning context should call [`RateLimiter::tick`]
    pub drain_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::default(),
            max_queue_size: 1024,
            requeue_retries: 0,
            requeue_base_delay: Duration::from_millis(100),
            requeue_max_delay: Duration::from_secs(10),
            drain_interval: Duration::from_millis(50),
        }
    }
}

impl RateLimiterConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the admission strategy.
    pub fn strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the pending-queue bound.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Sets the resubmission budget for retryable failures.
    pub fn requeue_retries(mut self, retries: u32) -> Self {
        self.requeue_retries = retries;
        self
    }

    /// Sets the resubmission backoff base.
    pub fn requeue_base_delay(mut self, delay: Duration) -> Self {
        self.requeue_base_delay = delay;
        self
    }

    /// Sets the drain tick interval.
    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }
}

/// Read-only snapshot of limiter activity.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterMetrics {
    /// Admission requests seen (including resubmissions)
    pub total_requests: u64,
    /// Requests admitted, immediately or from the queue
    pub accepted_requests: u64,
    /// Requests rejected (queue overflow or queue cleared)
    pub rejected_requests: u64,
    /// Current pending-queue depth
    pub queued_requests: usize,
    /// Capacity available right now (tokens, or free window slots)
    pub available_capacity: f64,
    /// Sustained admission rate per second under the current strategy
    pub current_rate: f64,
}

// ===== Strategy internals =====

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    config: TokenBucketConfig,
}

impl TokenBucket {
    fn new(config: TokenBucketConfig) -> Self {
        Self {
            tokens: config.max_tokens as f64,
            last_refill: Instant::now(),
            config,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens =
            (self.tokens + elapsed * self.config.refill_rate).min(self.config.max_tokens as f64);
        self.last_refill = now;
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

struct SlidingWindow {
    timestamps: VecDeque<Instant>,
    config: SlidingWindowConfig,
}

impl SlidingWindow {
    fn new(config: SlidingWindowConfig) -> Self {
        Self {
            timestamps: VecDeque::new(),
            config,
        }
    }

    // The window is half-open: a timestamp exactly `window` old no longer
    // counts against the limit.
    fn prune(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.config.window) {
            while self
                .timestamps
                .front()
                .is_some_and(|&ts| ts <= cutoff)
            {
                self.timestamps.pop_front();
            }
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.timestamps.len() < self.config.max_requests {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    fn available(&mut self, now: Instant) -> f64 {
        self.prune(now);
        self.config.max_requests.saturating_sub(self.timestamps.len()) as f64
    }

    fn rate_per_second(&self) -> f64 {
        let secs = self.config.window.as_secs_f64();
        if secs > 0.0 {
            self.config.max_requests as f64 / secs
        } else {
            0.0
        }
    }
}

struct AdaptiveState {
    bucket: TokenBucket,
    samples: VecDeque<Duration>,
    last_adjust: Instant,
    config: AdaptiveConfig,
}

impl AdaptiveState {
    fn new(config: AdaptiveConfig) -> Self {
        Self {
            bucket: TokenBucket::new(config.bucket),
            samples: VecDeque::with_capacity(config.sample_capacity),
            last_adjust: Instant::now(),
            config,
        }
    }

    fn record_sample(&mut self, response_time: Duration) {
        if self.samples.len() == self.config.sample_capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(response_time);
    }

    fn maybe_adjust(&mut self, now: Instant) -> Option<f64> {
        if now.saturating_duration_since(self.last_adjust) < self.config.adjust_interval
            || self.samples.is_empty()
        {
            return None;
        }

        let total: Duration = self.samples.iter().sum();
        let average = total / self.samples.len() as u32;
        let target = self.config.target_response_time;

        let mut rate = self.bucket.config.refill_rate;
        if average > target {
            rate *= 1.0 - self.config.adjustment_factor;
        } else if average < target.mul_f64(0.8) {
            rate *= 1.0 + self.config.adjustment_factor;
        }
        rate = rate.max(self.config.min_rate);

        self.bucket.config.refill_rate = rate;
        self.last_adjust = now;
        self.samples.clear();
        Some(rate)
    }
}

enum StrategyState {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindow),
    Adaptive(AdaptiveState),
}

impl StrategyState {
    fn from_strategy(strategy: &RateLimitStrategy) -> Self {
        match strategy {
            RateLimitStrategy::TokenBucket(config) => {
                StrategyState::TokenBucket(TokenBucket::new(*config))
            }
            RateLimitStrategy::SlidingWindow(config) => {
                StrategyState::SlidingWindow(SlidingWindow::new(*config))
            }
            RateLimitStrategy::Adaptive(config) => {
                StrategyState::Adaptive(AdaptiveState::new(config.clone()))
            }
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        match self {
            StrategyState::TokenBucket(bucket) => bucket.try_acquire(now),
            StrategyState::SlidingWindow(window) => window.try_acquire(now),
            StrategyState::Adaptive(state) => state.bucket.try_acquire(now),
        }
    }

    fn available_capacity(&mut self, now: Instant) -> f64 {
        match self {
            StrategyState::TokenBucket(bucket) => bucket.available(now),
            StrategyState::SlidingWindow(window) => window.available(now),
            StrategyState::Adaptive(state) => state.bucket.available(now),
        }
    }

    fn current_rate(&self) -> f64 {
        match self {
            StrategyState::TokenBucket(bucket) => bucket.config.refill_rate,
            StrategyState::SlidingWindow(window) => window.rate_per_second(),
            StrategyState::Adaptive(state) => state.bucket.config.refill_rate,
        }
    }

    fn record_response_time(&mut self, response_time: Duration) {
        if let StrategyState::Adaptive(state) = self {
            state.record_sample(response_time);
        }
    }

    fn maybe_adjust(&mut self, now: Instant) -> Option<f64> {
        match self {
            StrategyState::Adaptive(state) => state.maybe_adjust(now),
            _ => None,
        }
    }
}

// ===== Queue =====

struct Waiter {
    id: Uuid,
    priority: u8,
    seq: u64,
    enqueued_at: Instant,
    operation: String,
    grant: oneshot::Sender<GatewayResult<()>>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: highest priority first, FIFO among equals.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LimiterState {
    strategy: StrategyState,
    queue: BinaryHeap<Waiter>,
    seq: u64,
    total: u64,
    accepted: u64,
    rejected: u64,
}

/// Gates admission of work and queues the overflow by priority.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    config: RateLimiterConfig,
    metrics: Arc<dyn MetricsCollector>,
}

impl RateLimiter {
    /// Creates a limiter with the given configuration and no metrics sink.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                strategy: StrategyState::from_strategy(&config.strategy),
                queue: BinaryHeap::new(),
                seq: 0,
                total: 0,
                accepted: 0,
                rejected: 0,
            }),
            config,
            metrics: Arc::new(NoopMetricsCollector),
        }
    }

    /// Attaches a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The configuration this limiter runs under.
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Runs `work` once admission is granted.
    ///
    /// Immediate admission happens when the queue is empty and the strategy
    /// has capacity; otherwise the call waits in the priority queue (higher
    /// `priority` first, FIFO among equals) until a drain tick grants it or
    /// the queue is cleared. If `work` fails retryably and
    /// `requeue_retries` allows, the request re-enters admission after an
    /// exponential backoff.
    pub async fn execute<F, Fut, T>(&self, operation: &str, priority: u8, work: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let mut retries_remaining = self.config.requeue_retries;
        let mut attempt: u32 = 0;

        loop {
            self.admit(operation, priority).await?;
            attempt += 1;

            let started = Instant::now();
            let result = work().await;
            self.note_completion(started.elapsed());

            match result {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if retries_remaining > 0 && error.is_retryable() {
                        retries_remaining -= 1;
                        let delay = self.requeue_delay(attempt);
                        debug!(
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Re-enqueueing after retryable failure"
                        );
                        sleep(delay).await;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Grants queued requests while capacity allows and applies any pending
    /// adaptive rate adjustment. Call this on a fixed interval.
    pub fn tick(&self) {
        let mut state = self.state.lock();
        if let Some(rate) = state.strategy.maybe_adjust(Instant::now()) {
            debug!(rate, "Adaptive refill rate adjusted");
        }
        self.drain_locked(&mut state);
    }

    /// Rejects every pending request with [`GatewayError::QueueCleared`].
    /// Returns how many were rejected. No request is silently dropped.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.state.lock();
        let waiters: Vec<Waiter> = state.queue.drain().collect();
        let count = waiters.len();
        state.rejected += count as u64;
        drop(state);

        for waiter in waiters {
            let Waiter {
                operation, grant, ..
            } = waiter;
            let _ = grant.send(Err(GatewayError::QueueCleared { operation }));
        }
        if count > 0 {
            warn!(count, "Cleared rate limiter queue");
            self.metrics.increment_counter(
                metric_names::RATE_LIMIT_REJECTIONS,
                count as u64,
                &[("reason", "queue_cleared")],
            );
        }
        self.metrics
            .set_gauge(metric_names::RATE_LIMIT_QUEUE_DEPTH, 0.0, &[]);
        count
    }

    /// Replaces the admission strategy at runtime.
    ///
    /// Accumulated metrics and the pending queue are preserved; strategy-
    /// internal state (outstanding tokens, window contents) is discarded.
    /// Callers observe this as a capacity discontinuity.
    pub fn set_strategy(&self, strategy: RateLimitStrategy) {
        let mut state = self.state.lock();
        state.strategy = StrategyState::from_strategy(&strategy);
        debug!("Rate limiter strategy replaced; in-flight strategy state discarded");
    }

    /// Takes a snapshot of limiter activity.
    pub fn metrics(&self) -> RateLimiterMetrics {
        let mut state = self.state.lock();
        let now = Instant::now();
        RateLimiterMetrics {
            total_requests: state.total,
            accepted_requests: state.accepted,
            rejected_requests: state.rejected,
            queued_requests: state.queue.len(),
            available_capacity: state.strategy.available_capacity(now),
            current_rate: state.strategy.current_rate(),
        }
    }

    async fn admit(&self, operation: &str, priority: u8) -> GatewayResult<()> {
        let receiver = {
            let mut state = self.state.lock();
            state.total += 1;
            let now = Instant::now();

            if state.queue.is_empty() && state.strategy.try_acquire(now) {
                state.accepted += 1;
                None
            } else if state.queue.len() >= self.config.max_queue_size {
                state.rejected += 1;
                self.metrics.increment_counter(
                    metric_names::RATE_LIMIT_REJECTIONS,
                    1,
                    &[("reason", "queue_full")],
                );
                return Err(GatewayError::RateLimited {
                    message: format!(
                        "Admission queue is full ({} pending)",
                        state.queue.len()
                    ),
                    retry_after: None,
                });
            } else {
                let (grant, receiver) = oneshot::channel();
                let seq = state.seq;
                state.seq += 1;
                state.queue.push(Waiter {
                    id: Uuid::new_v4(),
                    priority,
                    seq,
                    enqueued_at: now,
                    operation: operation.to_string(),
                    grant,
                });
                self.metrics.set_gauge(
                    metric_names::RATE_LIMIT_QUEUE_DEPTH,
                    state.queue.len() as f64,
                    &[],
                );
                debug!(operation, priority, "Queued awaiting admission");
                Some(receiver)
            }
        };

        match receiver {
            None => Ok(()),
            Some(receiver) => match receiver.await {
                Ok(grant_result) => grant_result,
                Err(_) => Err(GatewayError::Internal {
                    message: "Admission grant dropped without resolution".to_string(),
                }),
            },
        }
    }

    fn note_completion(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        state.strategy.record_response_time(elapsed);
        if let Some(rate) = state.strategy.maybe_adjust(Instant::now()) {
            debug!(rate, "Adaptive refill rate adjusted");
        }
        self.drain_locked(&mut state);
    }

    // Grants happen while holding the lock; the granted task resumes on its
    // own and runs its work concurrently with further pops.
    fn drain_locked(&self, state: &mut LimiterState) {
        let now = Instant::now();
        loop {
            if state.queue.is_empty() {
                break;
            }
            if !state.strategy.try_acquire(now) {
                break;
            }
            let waiter = state.queue.pop().expect("queue is non-empty");
            state.accepted += 1;
            if waiter.grant.send(Ok(())).is_err() {
                // Caller abandoned the request; the consumed token is forfeit.
                debug!(
                    id = %waiter.id,
                    operation = %waiter.operation,
                    waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                    "Dropping grant for abandoned request"
                );
            }
        }
        self.metrics.set_gauge(
            metric_names::RATE_LIMIT_QUEUE_DEPTH,
            state.queue.len() as f64,
            &[],
        );
    }

    fn requeue_delay(&self, attempt: u32) -> Duration {
        let base = self.config.requeue_base_delay.as_millis() as f64
            * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.requeue_max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_config(max_tokens: u32, refill_rate: f64) -> RateLimiterConfig {
        RateLimiterConfig::new().strategy(RateLimitStrategy::TokenBucket(TokenBucketConfig {
            max_tokens,
            refill_rate,
        }))
    }

    async fn wait_for_queue_depth(limiter: &RateLimiter, depth: usize) {
        for _ in 0..200 {
            if limiter.metrics().queued_requests == depth {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("queue never reached depth {}", depth);
    }

    #[test]
    fn token_bucket_conservation() {
        let mut bucket = TokenBucket::new(TokenBucketConfig {
            max_tokens: 5,
            refill_rate: 0.0,
        });
        let now = Instant::now();

        for _ in 0..5 {
            assert!(bucket.try_acquire(now));
        }
        assert!(!bucket.try_acquire(now));
        assert!(bucket.available(now) >= 0.0);

        // Refill never exceeds capacity.
        let mut fast = TokenBucket::new(TokenBucketConfig {
            max_tokens: 3,
            refill_rate: 1000.0,
        });
        assert!(fast.try_acquire(now));
        fast.refill(now + Duration::from_secs(60));
        assert_eq!(fast.available(now + Duration::from_secs(60)), 3.0);
    }

    #[test]
    fn sliding_window_boundary_is_half_open() {
        let config = SlidingWindowConfig {
            window: Duration::from_secs(10),
            max_requests: 1,
        };
        let mut window = SlidingWindow::new(config);
        let start = Instant::now();

        assert!(window.try_acquire(start));
        assert!(!window.try_acquire(start + Duration::from_secs(5)));
        // A timestamp exactly `window` old is excluded from the count.
        assert!(window.try_acquire(start + Duration::from_secs(10)));
    }

    #[test]
    fn sliding_window_prunes_lazily() {
        let config = SlidingWindowConfig {
            window: Duration::from_secs(1),
            max_requests: 3,
        };
        let mut window = SlidingWindow::new(config);
        let start = Instant::now();

        for _ in 0..3 {
            assert!(window.try_acquire(start));
        }
        assert_eq!(window.available(start), 0.0);
        assert_eq!(window.available(start + Duration::from_secs(2)), 3.0);
        assert!(window.timestamps.is_empty());
    }

    #[test]
    fn adaptive_rate_feedback() {
        let config = AdaptiveConfig {
            bucket: TokenBucketConfig {
                max_tokens: 10,
                refill_rate: 10.0,
            },
            target_response_time: Duration::from_millis(100),
            adjustment_factor: 0.2,
            adjust_interval: Duration::ZERO,
            sample_capacity: 10,
            min_rate: 1.0,
        };

        // Slow responses shrink the rate.
        let mut state = AdaptiveState::new(config.clone());
        state.record_sample(Duration::from_millis(500));
        let now = Instant::now();
        let adjusted = state.maybe_adjust(now).unwrap();
        assert!((adjusted - 8.0).abs() < 1e-9);

        // Fast responses (under 80% of target) grow it.
        let mut state = AdaptiveState::new(config.clone());
        state.record_sample(Duration::from_millis(10));
        let adjusted = state.maybe_adjust(now).unwrap();
        assert!((adjusted - 12.0).abs() < 1e-9);

        // The rate never drops below the floor.
        let mut state = AdaptiveState::new(AdaptiveConfig {
            bucket: TokenBucketConfig {
                max_tokens: 10,
                refill_rate: 1.0,
            },
            ..config
        });
        state.record_sample(Duration::from_secs(5));
        assert_eq!(state.maybe_adjust(now), Some(1.0));
    }

    #[test]
    fn adaptive_between_bands_holds_rate() {
        let mut state = AdaptiveState::new(AdaptiveConfig {
            bucket: TokenBucketConfig {
                max_tokens: 10,
                refill_rate: 10.0,
            },
            target_response_time: Duration::from_millis(100),
            adjustment_factor: 0.2,
            adjust_interval: Duration::ZERO,
            sample_capacity: 10,
            min_rate: 1.0,
        });
        // 90ms is below target but above the 80% band: no change.
        state.record_sample(Duration::from_millis(90));
        assert_eq!(state.maybe_adjust(Instant::now()), Some(10.0));
    }

    #[tokio::test]
    async fn immediate_admission_within_capacity() {
        let limiter = RateLimiter::new(bucket_config(2, 0.0));
        assert_eq!(limiter.execute("op", 1, || async { Ok(1) }).await.unwrap(), 1);
        assert_eq!(limiter.execute("op", 1, || async { Ok(2) }).await.unwrap(), 2);

        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.accepted_requests, 2);
        assert_eq!(metrics.available_capacity, 0.0);
    }

    #[tokio::test]
    async fn third_request_queues_until_refill() {
        let limiter = Arc::new(RateLimiter::new(bucket_config(2, 0.0)));

        assert!(limiter.execute("op", 1, || async { Ok(()) }).await.is_ok());
        assert!(limiter.execute("op", 1, || async { Ok(()) }).await.is_ok());

        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.execute("op", 1, || async { Ok(3) }).await })
        };
        wait_for_queue_depth(&limiter, 1).await;

        // A manual capacity top-up stands in for elapsed refill time.
        limiter.set_strategy(RateLimitStrategy::TokenBucket(TokenBucketConfig {
            max_tokens: 1,
            refill_rate: 0.0,
        }));
        limiter.tick();

        assert_eq!(queued.await.unwrap().unwrap(), 3);
        assert_eq!(limiter.metrics().queued_requests, 0);
    }

    #[tokio::test]
    async fn drain_respects_priority_then_fifo() {
        let limiter = Arc::new(RateLimiter::new(bucket_config(0, 0.0)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, priority) in [("low", 1u8), ("high-a", 5), ("high-b", 5)] {
            let task_limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                task_limiter
                    .execute("op", priority, || async {
                        order.lock().push(label);
                        Ok(())
                    })
                    .await
            }));
            wait_for_queue_depth(&limiter, handles.len()).await;
        }

        // Release one slot at a time so grant order is observable.
        for _ in 0..3 {
            let before = order.lock().len();
            limiter.set_strategy(RateLimitStrategy::TokenBucket(TokenBucketConfig {
                max_tokens: 1,
                refill_rate: 0.0,
            }));
            limiter.tick();
            for _ in 0..200 {
                if order.lock().len() > before {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec!["high-a", "high-b", "low"]);
    }

    #[tokio::test]
    async fn clear_queue_rejects_every_waiter() {
        let limiter = Arc::new(RateLimiter::new(bucket_config(0, 0.0)));

        let mut handles = Vec::new();
        for i in 0..2 {
            let task_limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                task_limiter.execute("contacts.list", 1, || async { Ok(i) }).await
            }));
            wait_for_queue_depth(&limiter, i as usize + 1).await;
        }

        assert_eq!(limiter.clear_queue(), 2);
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(GatewayError::QueueCleared { .. })));
        }
        assert_eq!(limiter.metrics().rejected_requests, 2);
    }

    #[tokio::test]
    async fn queue_overflow_rejects_immediately() {
        let config = bucket_config(0, 0.0).max_queue_size(1);
        let limiter = Arc::new(RateLimiter::new(config));

        let _queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.execute("op", 1, || async { Ok(()) }).await })
        };
        wait_for_queue_depth(&limiter, 1).await;

        let result = limiter.execute("op", 1, || async { Ok(()) }).await;
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));
        assert_eq!(limiter.metrics().rejected_requests, 1);
        limiter.clear_queue();
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_retries_retryable_failures() {
        let config = bucket_config(10, 0.0)
            .requeue_retries(1)
            .requeue_base_delay(Duration::from_millis(1));
        let limiter = RateLimiter::new(config);
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let calls_ref = calls.clone();
        let result = limiter
            .execute("op", 1, move || {
                let calls = calls_ref.clone();
                async move {
                    if calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        Err(GatewayError::Upstream {
                            message: "service unavailable".to_string(),
                            status: Some(503),
                        })
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_propagates() {
        let config = bucket_config(10, 0.0).requeue_retries(3);
        let limiter = RateLimiter::new(config);

        let result: GatewayResult<()> = limiter
            .execute("op", 1, || async {
                Err(GatewayError::Upstream {
                    message: "bad request".to_string(),
                    status: Some(400),
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(GatewayError::Upstream {
                status: Some(400),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn strategy_swap_preserves_metrics() {
        let limiter = RateLimiter::new(bucket_config(5, 0.0));
        limiter.execute("op", 1, || async { Ok(()) }).await.unwrap();

        limiter.set_strategy(RateLimitStrategy::SlidingWindow(SlidingWindowConfig {
            window: Duration::from_secs(1),
            max_requests: 2,
        }));

        let metrics = limiter.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.accepted_requests, 1);
        assert_eq!(metrics.available_capacity, 2.0);
        assert_eq!(metrics.current_rate, 2.0);
    }
}
