//! Retry engine with classification-driven policy and exponential backoff.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::{ErrorKind, GatewayError, GatewayResult};
use crate::observability::{metric_names, MetricsCollector, NoopMetricsCollector};

/// Configuration for retry behavior.
///
/// Every field has an explicit default; see [`RetryConfig::default`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any computed delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Jitter fraction in `[0, 1]`, applied as `± delay * jitter`
    pub jitter: f64,
    /// Error kinds eligible for retry
    pub retryable_kinds: HashSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.1,
            retryable_kinds: Self::default_retryable_kinds(),
        }
    }
}

impl RetryConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The default retryable set: everything that might change on a second
    /// attempt, including `Unknown` (treated optimistically).
    pub fn default_retryable_kinds() -> HashSet<ErrorKind> {
        [
            ErrorKind::Transient,
            ErrorKind::RateLimited,
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::ServerError,
            ErrorKind::Unknown,
        ]
        .into_iter()
        .collect()
    }

    /// Like the default set but excluding `Unknown`, for operations where an
    /// unclassified failure must not be replayed.
    pub fn conservative() -> Self {
        let mut config = Self::default();
        config.retryable_kinds.remove(&ErrorKind::Unknown);
        config
    }

    /// Sets the maximum number of retries.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Sets the delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay ceiling.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction (clamped to `[0, 1]` at use).
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the retryable kind set.
    pub fn retryable_kinds(mut self, kinds: HashSet<ErrorKind>) -> Self {
        self.retryable_kinds = kinds;
        self
    }
}

/// Decision returned by a [`RetryHook`].
#[derive(Debug)]
pub enum RetryDecision {
    /// Proceed with the computed delay
    Default,
    /// Proceed, but sleep this long instead
    Retry(Duration),
    /// Stop retrying and surface the current error
    Abort,
}

/// Context handed to a [`RetryHook`] before each retry.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Operation name the work was submitted under
    pub operation: String,
    /// 1-based attempt number that just failed
    pub attempt: u32,
    /// Classification of the failure
    pub kind: ErrorKind,
    /// Delay the engine intends to sleep
    pub delay: Duration,
    /// The failure itself
    pub error: GatewayError,
}

/// Per-attempt callback for custom retry behavior.
#[async_trait]
pub trait RetryHook: Send + Sync {
    /// Called after each failed attempt that the engine intends to retry.
    async fn on_retry(&self, context: RetryContext) -> RetryDecision;
}

/// Predicate overriding kind-based retryability.
pub type RetryPredicate = Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>;

/// Terminal outcome of one retry-engine invocation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The final result, success or the last error observed
    pub result: GatewayResult<T>,
    /// Number of attempts made (1-based; never zero)
    pub attempts: u32,
    /// Total time spent sleeping between attempts
    pub total_delay: Duration,
    /// Classification of the final error, `None` on success
    pub final_error_kind: Option<ErrorKind>,
}

impl<T> RetryOutcome<T> {
    /// Whether the work eventually succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Unwraps into the plain result, discarding attempt bookkeeping.
    pub fn into_result(self) -> GatewayResult<T> {
        self.result
    }
}

/// Executes units of work under a [`RetryConfig`].
pub struct RetryExecutor {
    config: RetryConfig,
    metrics: Arc<dyn MetricsCollector>,
    hook: Option<Arc<dyn RetryHook>>,
    predicate: Option<RetryPredicate>,
}

impl RetryExecutor {
    /// Creates an executor with the given configuration and no metrics sink.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(NoopMetricsCollector),
            hook: None,
            predicate: None,
        }
    }

    /// Attaches a metrics collector.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attaches a per-attempt hook.
    pub fn with_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Replaces kind-based retryability with a custom predicate.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// The configuration this executor runs under.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `f` until it succeeds, exhausts the retry budget, or hits a
    /// non-retryable failure. Returns the full attempt report; never panics
    /// on failure.
    pub async fn run<F, Fut, T>(&self, operation: &str, f: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = GatewayResult<T>> + Send,
        T: Send,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut total_delay = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.metrics.increment_counter(
                            metric_names::RETRY_RECOVERIES,
                            1,
                            &[("operation", operation)],
                        );
                        debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_delay,
                        final_error_kind: None,
                    };
                }
                Err(error) => {
                    let kind = error.kind();
                    self.metrics.increment_counter(
                        metric_names::RETRY_ATTEMPTS,
                        1,
                        &[("operation", operation), ("kind", kind.as_str())],
                    );

                    let retryable = self.is_retryable(&error, kind);
                    if !retryable || attempt >= max_attempts {
                        if retryable {
                            self.metrics.increment_counter(
                                metric_names::RETRY_EXHAUSTED,
                                1,
                                &[("operation", operation), ("kind", kind.as_str())],
                            );
                            warn!(
                                operation,
                                attempt,
                                kind = kind.as_str(),
                                error = %error,
                                "Retry budget exhausted"
                            );
                        } else {
                            debug!(
                                operation,
                                kind = kind.as_str(),
                                error = %error,
                                "Error is not retryable"
                            );
                        }
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                            total_delay,
                            final_error_kind: Some(kind),
                        };
                    }

                    let mut delay = self.delay_for(kind, &error, attempt);
                    if let Some(hook) = &self.hook {
                        let context = RetryContext {
                            operation: operation.to_string(),
                            attempt,
                            kind,
                            delay,
                            error: error.clone(),
                        };
                        match hook.on_retry(context).await {
                            RetryDecision::Abort => {
                                return RetryOutcome {
                                    result: Err(error),
                                    attempts: attempt,
                                    total_delay,
                                    final_error_kind: Some(kind),
                                }
                            }
                            RetryDecision::Retry(custom) => delay = custom,
                            RetryDecision::Default => {}
                        }
                    }

                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        kind = kind.as_str(),
                        "Retrying after failure"
                    );
                    sleep(delay).await;
                    total_delay += delay;
                }
            }
        }
    }

    /// Runs `f` with retry and returns the plain result.
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> GatewayResult<T>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = GatewayResult<T>> + Send,
        T: Send,
    {
        self.run(operation, f).await.into_result()
    }

    fn is_retryable(&self, error: &GatewayError, kind: ErrorKind) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(error),
            None => self.config.retryable_kinds.contains(&kind),
        }
    }

    fn delay_for(&self, kind: ErrorKind, error: &GatewayError, attempt: u32) -> Duration {
        if kind == ErrorKind::RateLimited {
            // Honor the server's hint when one is present; otherwise wait the
            // maximum, since the limit window length is unknown.
            return error.retry_after().unwrap_or(self.config.max_delay);
        }

        let base = self.config.base_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_delay.as_millis() as f64);
        let jitter_range = capped * self.config.jitter.clamp(0.0, 1.0);
        let jittered = if jitter_range > 0.0 {
            capped + rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
