//! Accelerator configuration
//!
//! [`AcceleratorConfig`] groups the settings of every collaborator the
//! executor wires together. It deserializes from the camelCase JSON surface:
//!
//! ```json
//! {
//!   "queryPlanCache": { "maxSize": 1000, "ttl": 300000 },
//!   "dataLoaderConfig": { "maxBatchSize": 50, "batchWindowMs": 10 },
//!   "metricsCollection": { "enabled": true, "collectExecutionMetrics": true },
//!   "circuitBreaker": { "failureThreshold": 5, "timeoutMs": 60000 }
//! }
//! ```
//!
//! Durations are expressed in milliseconds. Missing sections fall back to
//! their defaults.
//!
//! ## Presets
//!
//! ```rust
//! use federation_accelerator::AcceleratorConfig;
//!
//! let dev = AcceleratorConfig::development();
//! let prod = AcceleratorConfig::production();
//! assert!(prod.query_plan_cache.max_size > dev.query_plan_cache.max_size);
//! ```

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dataloader::DataLoaderConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsConfig;
use crate::plan_cache::{EvictionMode, EvictionStrategy, PlanCacheConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for every component of the accelerator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcceleratorConfig {
    pub query_plan_cache: PlanCacheConfig,
    #[serde(rename = "dataLoaderConfig")]
    pub data_loader: DataLoaderConfig,
    #[serde(rename = "metricsCollection")]
    pub metrics: MetricsConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl AcceleratorConfig {
    /// Small cache, short TTL, eager breaker. Suited to local iteration.
    pub fn development() -> Self {
        Self {
            query_plan_cache: PlanCacheConfig {
                max_size: 100,
                ttl: Some(Duration::from_secs(60)),
                strategy: EvictionStrategy::Lru,
                eviction: EvictionMode::Single,
            },
            data_loader: DataLoaderConfig {
                max_batch_size: 10,
                batch_window: Duration::from_millis(10),
            },
            metrics: MetricsConfig {
                max_buffer_size: 1000,
                ..MetricsConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                timeout: Duration::from_secs(10),
                ..CircuitBreakerConfig::default()
            },
        }
    }

    /// Large cache with batch eviction and wide batches
    pub fn production() -> Self {
        Self {
            query_plan_cache: PlanCacheConfig {
                max_size: 10_000,
                ttl: Some(Duration::from_secs(3600)),
                strategy: EvictionStrategy::Lru,
                eviction: EvictionMode::Batch {
                    fraction: 0.1,
                    batch_size: 10,
                },
            },
            data_loader: DataLoaderConfig {
                max_batch_size: 100,
                batch_window: Duration::from_millis(5),
            },
            metrics: MetricsConfig {
                max_buffer_size: 10_000,
                ..MetricsConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    /// Pick a preset from the `ENV` environment variable.
    ///
    /// `production`/`prod` and `development`/`dev` select the matching preset;
    /// anything else (or unset) yields [`AcceleratorConfig::default`].
    pub fn from_env() -> Self {
        match std::env::var("ENV").as_deref() {
            Ok("production") | Ok("prod") => Self::production(),
            Ok("development") | Ok("dev") => Self::development(),
            _ => Self::default(),
        }
    }

    /// Parse from a JSON document and validate
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file and parse it with [`Self::from_json_str`]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Set the plan cache capacity
    pub fn with_plan_cache_size(mut self, max_size: usize) -> Self {
        self.query_plan_cache.max_size = max_size;
        self
    }

    /// Set the plan cache TTL
    pub fn with_plan_cache_ttl(mut self, ttl: Duration) -> Self {
        self.query_plan_cache.ttl = Some(ttl);
        self
    }

    /// Set the loader batch size and window
    pub fn with_batching(mut self, max_batch_size: usize, batch_window: Duration) -> Self {
        self.data_loader.max_batch_size = max_batch_size;
        self.data_loader.batch_window = batch_window;
        self
    }

    /// Replace the default breaker configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Turn metrics collection on or off
    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics.enabled = enabled;
        self
    }

    /// Reject settings that would make a component misbehave
    pub fn validate(&self) -> Result<()> {
        if self.data_loader.max_batch_size == 0 {
            return Err(Error::Config(
                "dataLoaderConfig.maxBatchSize must be at least 1".to_string(),
            ));
        }
        if let EvictionMode::Batch { fraction, .. } = self.query_plan_cache.eviction {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(Error::Config(format!(
                    "queryPlanCache eviction fraction must be within 0..=1, got {}",
                    fraction
                )));
            }
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "circuitBreaker.failureThreshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(Error::Config(
                "circuitBreaker.successThreshold must be at least 1".to_string(),
            ));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(Error::Config(
                "circuitBreaker.halfOpenMaxCalls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Same as [`duration_ms`] for optional durations
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
