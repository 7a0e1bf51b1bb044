//! # federation-accelerator
//!
//! Execution-side acceleration for federated GraphQL: plan once, batch entity
//! fetches, and stop hammering subgraphs that are down.
//!
//! ## Features
//!
//! - **Plan Caching**: Bounded [`PlanCache`] with LRU, LFU or FIFO eviction and TTL expiry
//! - **Batching**: Per-service [`BatchLoader`]s coalesce entity lookups into one call per window
//! - **Circuit Breaking**: [`CircuitBreakerRegistry`] fails fast while a subgraph is unhealthy
//! - **Metrics**: [`MetricsCollector`] keeps percentiles, hit rates and error counts,
//!   and exports them in Prometheus text format
//!
//! ## Main Components
//!
//! - [`OptimizedExecutor`]: Runs queries through all of the above.
//! - [`OptimizedExecutorBuilder`]: Wires the executor from a schema, planner and transport.
//! - [`QueryPlanner`]: Produces a [`QueryPlan`] for a query.
//! - [`SubgraphTransport`]: Sends operations and entity lookups to subgraphs.
//! - [`AcceleratorConfig`]: Settings for every component, with development and
//!   production presets.
//!
//! ## Example
//!
//! ```rust,no_run
//! use federation_accelerator::{AcceleratorConfig, CircuitBreakerRegistry, PlanCache};
//!
//! let config = AcceleratorConfig::production();
//! let cache = PlanCache::new(config.query_plan_cache.clone());
//! let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
//!
//! assert!(cache.is_empty());
//! assert!(breakers.status().is_empty());
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod dataloader;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod plan;
pub mod plan_cache;

pub use circuit_breaker::{
    create_circuit_breaker_registry, CallError, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitBreakerMetrics, CircuitBreakerOverrides, CircuitBreakerRegistry,
    CircuitState, RegistrySummary, SharedCircuitBreakerRegistry, StateChangeListener,
};
pub use config::AcceleratorConfig;
pub use dataloader::{
    create_loader_registry, BatchLoader, DataLoaderConfig, EntityKey, LoaderError,
    LoaderRegistry, LoaderStats, SharedLoaderRegistry,
};
pub use error::{Error, GraphQLError, Result};
pub use executor::{
    ExecutionContext, ExecutionResult, OptimizedExecutor, OptimizedExecutorBuilder,
    SubgraphTransport,
};
pub use metrics::{
    create_metrics_collector, MetricsCollector, MetricsConfig, PerformanceMetrics,
    SharedMetricsCollector, SubgraphCall,
};
pub use plan::{
    FederatedSchema, KeySource, QueryPlan, QueryPlanner, QueryStep, StaticPlanner,
    StepOperation, SubgraphDefinition,
};
pub use plan_cache::{
    create_plan_cache, normalize_query, CacheStats, EvictionMode, EvictionStrategy, PlanCache,
    PlanCacheConfig, SharedPlanCache,
};
