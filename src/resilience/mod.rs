//! Resilience primitives: retry, rate limiting, deadlines.

pub mod rate_limiter;
pub mod retry;


use std::future::Future;
use std::time::Duration;

use crate::errors::{GatewayError, GatewayResult};

pub use rate_limiter::{
    AdaptiveConfig, RateLimitStrategy, RateLimiter, RateLimiterConfig, RateLimiterMetrics,
    SlidingWindowConfig, TokenBucketConfig,
};
pub use retry::{
    RetryConfig, RetryContext, RetryDecision, RetryExecutor, RetryHook, RetryOutcome,
    RetryPredicate,
};

/// Races `future` against a deadline.
///
/// Exceeding the deadline surfaces as a `timeout`-classified error through
/// the same path as any other failure; the underlying work is dropped, not
/// cancelled remotely — first response wins.
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, future: F) -> GatewayResult<T>
where
    F: Future<Output = GatewayResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            message: format!(
                "Operation '{}' exceeded its {}ms deadline",
                operation,
                limit.as_millis()
            ),
        }),
    }
}
