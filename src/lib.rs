//! # Operation Gateway Core
//!
//! Client-side resilience and flow-control stack for a gateway that
//! re-exposes a remote business API as named, callable operations.
//!
//! ## Features
//!
//! - Adaptive response cache: access-rate-driven TTLs, true-LRU eviction,
//!   tag and pattern invalidation, scheduled warming
//! - Multi-strategy rate limiter: token bucket, sliding window or
//!   adaptive-feedback admission with a priority queue for the overflow
//! - Priority batch processor: size/time-bounded grouping with positional
//!   result fan-out and all-or-nothing failure
//! - Classifying retry engine: error taxonomy, exponential backoff with
//!   jitter, rate-limit hints, per-attempt hooks
//! - Comprehensive observability (tracing, structured logging, metrics)
//!
//! All state is per-process and memory-resident; nothing is persisted and no
//! coordination happens across instances.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_gateway::{Gateway, GatewayConfig, GatewayError};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::from_env()?;
//!     let gateway = Gateway::new(config);
//!     gateway.start();
//!
//!     let contact = gateway
//!         .execute("contacts.get", 1, || async {
//!             // the remote call goes here
//!             Ok(json!({"id": 42}))
//!         })
//!         .await?;
//!
//!     gateway.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - `gateway` - The context object composing every component around a call
//! - `cache` - Adaptive response cache
//! - `resilience` - Retry engine, rate limiter, deadline helper
//! - `batch` - Priority batch processor
//! - `errors` - Error types and the classification taxonomy
//! - `config` - Configuration types, builder and env loading
//! - `observability` - Metrics traits and logging setup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod cache;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod resilience;

// Re-exports for convenience
pub use batch::{
    AddOptions, BatchConfig, BatchMetrics, BatchObserver, BatchProcessFn, BatchProcessor,
    NoopBatchObserver,
};
pub use cache::{
    AdaptiveCache, CacheConfig, CacheMetrics, CacheWriteOptions, WarmEntry, WarmFetcher,
};
pub use config::{GatewayConfig, GatewayConfigBuilder};
pub use errors::{classify, ErrorKind, GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewayBuilder, GatewaySnapshot};
pub use observability::{
    InMemoryMetricsCollector, LogFormat, LogLevel, LoggingConfig, MetricsCollector,
    MetricsSnapshot, NoopMetricsCollector,
};
pub use resilience::{
    with_timeout, AdaptiveConfig, RateLimitStrategy, RateLimiter, RateLimiterConfig,
    RateLimiterMetrics, RetryConfig, RetryContext, RetryDecision, RetryExecutor, RetryHook,
    RetryOutcome, SlidingWindowConfig, TokenBucketConfig,
};

/// The default maximum number of retry attempts
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The default cache capacity, in entries
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;
