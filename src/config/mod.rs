//! Configuration for the gateway core.
//!
//! Each component carries its own config type with explicit defaults; this
//! module aggregates them, adds environment-variable loading, and validates
//! cross-field constraints before a gateway is constructed.

use std::time::Duration;

use crate::batch::BatchConfig;
use crate::cache::CacheConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::resilience::{RateLimiterConfig, RetryConfig};

/// Aggregate configuration for a [`crate::gateway::Gateway`].
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Rate limiter settings
    pub rate_limit: RateLimiterConfig,
    /// Retry engine settings
    pub retry: RetryConfig,
    /// Adaptive cache settings
    pub cache: CacheConfig,
    /// Batch processor settings
    pub batch: BatchConfig,
}

impl GatewayConfig {
    /// Creates a configuration builder.
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Loads tunables from `GATEWAY_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> GatewayResult<Self> {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|raw| raw.parse().ok())
        }

        let mut config = Self::default();

        if let Some(max_retries) = var::<u32>("GATEWAY_MAX_RETRIES") {
            config.retry.max_retries = max_retries;
        }
        if let Some(base_delay_ms) = var::<u64>("GATEWAY_RETRY_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(base_delay_ms);
        }
        if let Some(max_entries) = var::<usize>("GATEWAY_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = max_entries;
        }
        if let Some(base_ttl_secs) = var::<u64>("GATEWAY_CACHE_BASE_TTL_SECS") {
            config.cache.base_ttl = Duration::from_secs(base_ttl_secs);
        }
        if let Some(max_queue) = var::<usize>("GATEWAY_RATE_LIMIT_MAX_QUEUE") {
            config.rate_limit.max_queue_size = max_queue;
        }
        if let Some(batch_size) = var::<usize>("GATEWAY_BATCH_MAX_SIZE") {
            config.batch.max_batch_size = batch_size;
        }
        if let Some(batch_wait_ms) = var::<u64>("GATEWAY_BATCH_MAX_WAIT_MS") {
            config.batch.max_wait = Duration::from_millis(batch_wait_ms);
        }
        if let Some(concurrency) = var::<usize>("GATEWAY_BATCH_CONCURRENCY") {
            config.batch.max_concurrency = concurrency;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> GatewayResult<()> {
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(GatewayError::Configuration {
                message: format!("retry.jitter must be in [0, 1], got {}", self.retry.jitter),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(GatewayError::Configuration {
                message: format!(
                    "retry.backoff_multiplier must be >= 1, got {}",
                    self.retry.backoff_multiplier
                ),
            });
        }
        if self.batch.max_batch_size == 0 {
            return Err(GatewayError::Configuration {
                message: "batch.max_batch_size must be at least 1".to_string(),
            });
        }
        if self.batch.max_concurrency == 0 {
            return Err(GatewayError::Configuration {
                message: "batch.max_concurrency must be at least 1".to_string(),
            });
        }
        if self.cache.min_ttl > self.cache.max_ttl {
            return Err(GatewayError::Configuration {
                message: "cache.min_ttl must not exceed cache.max_ttl".to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    rate_limit: Option<RateLimiterConfig>,
    retry: Option<RetryConfig>,
    cache: Option<CacheConfig>,
    batch: Option<BatchConfig>,
}

impl GatewayConfigBuilder {
    /// Sets the rate limiter settings.
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Sets the retry engine settings.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Sets the cache settings.
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    /// Sets the batch processor settings.
    pub fn batch(mut self, config: BatchConfig) -> Self {
        self.batch = Some(config);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> GatewayResult<GatewayConfig> {
        let config = GatewayConfig {
            rate_limit: self.rate_limit.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            cache: self.cache.unwrap_or_default(),
            batch: self.batch.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(GatewayConfig::default().validate().is_ok());
        assert!(GatewayConfig::builder().build().is_ok());
    }

    #[test]
    fn builder_overrides_sections() {
        let config = GatewayConfig::builder()
            .retry(RetryConfig::new().max_retries(7))
            .batch(BatchConfig::new().max_batch_size(25))
            .build()
            .unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.batch.max_batch_size, 25);
    }

    #[test]
    fn out_of_range_jitter_is_rejected() {
        let result = GatewayConfig::builder()
            .retry(RetryConfig::new().jitter(1.5))
            .build();
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = GatewayConfig::builder()
            .batch(BatchConfig::new().max_batch_size(0))
            .build();
        assert!(matches!(result, Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn from_env_reads_overrides() {
        std::env::set_var("GATEWAY_MAX_RETRIES", "9");
        std::env::set_var("GATEWAY_BATCH_MAX_WAIT_MS", "250");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.retry.max_retries, 9);
        assert_eq!(config.batch.max_wait, Duration::from_millis(250));
        std::env::remove_var("GATEWAY_MAX_RETRIES");
        std::env::remove_var("GATEWAY_BATCH_MAX_WAIT_MS");
    }
}
