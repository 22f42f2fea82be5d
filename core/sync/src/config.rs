//! Configuration for the batched store.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use batchline_common::{Error, Result};

use crate::retry::RetryPolicy;

/// Configuration for batching, retries and caching.
///
/// Durations are carried as milliseconds so the struct maps one-to-one onto
/// its JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchConfig {
    /// Idle interval before queued writes are flushed.
    pub batch_interval: u64,
    /// Queue length that forces an immediate flush.
    pub max_batch_size: usize,
    /// Flush the very first write right away instead of waiting.
    pub immediate_first_operation: bool,
    /// Retry transient dispatch failures.
    pub auto_retry: bool,
    /// Retries allowed per operation after its first failed dispatch.
    pub max_retries: u32,
    /// Serve reads from the TTL cache.
    pub enable_cache: bool,
    /// Cache entry lifetime.
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: u64,
    /// Backoff for the first retry.
    pub retry_base_delay: u64,
    /// Upper bound for any backoff delay.
    pub retry_max_delay: u64,
    /// Scale backoff delays by a random factor in [0.75, 1.25).
    pub retry_jitter: bool,
}

impl BatchConfig {
    /// Set the idle flush interval.
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval.as_millis() as u64;
        self
    }

    /// Set the size threshold.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Flush the first write immediately.
    pub fn with_immediate_first_operation(mut self, enabled: bool) -> Self {
        self.immediate_first_operation = enabled;
        self
    }

    /// Enable or disable automatic retries.
    pub fn with_auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable the read cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    /// Set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl.as_millis() as u64;
        self
    }

    /// Set the base and maximum retry delays.
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base.as_millis() as u64;
        self.retry_max_delay = max.as_millis() as u64;
        self
    }

    /// Enable or disable backoff jitter.
    pub fn with_retry_jitter(mut self, jitter: bool) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Idle flush interval as a `Duration`.
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval)
    }

    /// Cache TTL as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl)
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .with_initial_delay(Duration::from_millis(self.retry_base_delay))
            .with_max_delay(Duration::from_millis(self.retry_max_delay))
            .with_jitter(self.retry_jitter)
    }

    /// Check the configuration for values the store cannot work with.
    ///
    /// # Errors
    /// - `maxBatchSize` is zero
    /// - `retryBaseDelay` exceeds `retryMaxDelay`
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidInput(
                "maxBatchSize must be at least 1".to_string(),
            ));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(Error::InvalidInput(format!(
                "retryBaseDelay ({}ms) exceeds retryMaxDelay ({}ms)",
                self.retry_base_delay, self.retry_max_delay
            )));
        }
        Ok(())
    }

    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_interval: 1000,
            max_batch_size: 10,
            immediate_first_operation: false,
            auto_retry: true,
            max_retries: 3,
            enable_cache: true,
            cache_ttl: 30_000,
            retry_base_delay: 1000,
            retry_max_delay: 30_000,
            retry_jitter: false,
        }
    }
}
