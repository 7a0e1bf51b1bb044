//! Performance metrics for the accelerator
//!
//! The [`MetricsCollector`] records execution, cache and subgraph events into
//! bounded ring buffers and aggregates them on demand into a
//! [`PerformanceMetrics`] snapshot. Recording never fails and never blocks on
//! anything but a short critical section.
//!
//! # Metrics Exposed
//!
//! [`MetricsCollector::flush`] publishes the current aggregate to a Prometheus
//! registry owned by the collector:
//!
//! - `accelerator_executions` - Executions by outcome
//! - `accelerator_execution_latency_ms` - Execution latency by statistic (mean, p50, p95, p99)
//! - `accelerator_cache_hit_rate` - Hit rate per cache
//! - `accelerator_subgraph_latency_ms` - Mean subgraph latency per service
//! - `accelerator_subgraph_error_rate` - Subgraph error rate per service
//! - `accelerator_errors` - Errors by kind
//!
//! # Example
//!
//! ```rust
//! use federation_accelerator::{MetricsCollector, MetricsConfig};
//! use std::time::Duration;
//!
//! let metrics = MetricsCollector::new(MetricsConfig::default());
//! metrics.record_execution_time("GetUser", Duration::from_millis(12));
//! metrics.record_cache_hit("plans");
//!
//! let snapshot = metrics.metrics();
//! assert_eq!(snapshot.execution.count, 1);
//! assert_eq!(snapshot.cache.hit_rate, 1.0);
//! ```

use crate::error::Error;
use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Entries kept per buffer after a flush
const RETAINED_AFTER_FLUSH: usize = 100;

/// Metrics collection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    /// Master switch; nothing is recorded when false
    pub enabled: bool,
    pub collect_execution_metrics: bool,
    pub collect_cache_metrics: bool,
    pub collect_subgraph_metrics: bool,
    /// Capacity of each ring buffer
    pub max_buffer_size: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_execution_metrics: true,
            collect_cache_metrics: true,
            collect_subgraph_metrics: true,
            max_buffer_size: 5000,
        }
    }
}

/// One remote call made while executing a plan
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphCall {
    pub service: String,
    pub operation: String,
    #[serde(with = "crate::config::duration_ms")]
    pub duration: Duration,
    pub success: bool,
    pub error_type: Option<String>,
}

impl SubgraphCall {
    pub fn success(service: impl Into<String>, operation: impl Into<String>, duration: Duration) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            duration,
            success: true,
            error_type: None,
        }
    }

    pub fn failure(
        service: impl Into<String>,
        operation: impl Into<String>,
        duration: Duration,
        error_type: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            duration,
            success: false,
            error_type: Some(error_type.into()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub count: usize,
    pub successes: usize,
    pub failures: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheCounts {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub by_cache: BTreeMap<String, CacheCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphMetrics {
    pub calls: usize,
    pub errors: usize,
    pub mean_latency_ms: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetrics {
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
    /// Errors per recorded execution
    pub error_rate: f64,
}

/// Aggregated snapshot of everything the collector has seen
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub execution: ExecutionMetrics,
    pub cache: CacheMetrics,
    pub subgraphs: BTreeMap<String, SubgraphMetrics>,
    pub errors: ErrorMetrics,
    pub uptime_ms: u64,
}

/// FIFO buffer that drops its oldest entry when full
#[derive(Debug)]
struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    fn retain_recent(&mut self, n: usize) {
        let excess = self.items.len().saturating_sub(n);
        self.items.drain(..excess);
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    duration: Duration,
    success: bool,
}

#[derive(Debug, Clone)]
struct CacheEvent {
    cache: String,
    hit: bool,
}

struct CollectorState {
    executions: RingBuffer<ExecutionRecord>,
    cache_events: RingBuffer<CacheEvent>,
    subgraph_calls: RingBuffer<SubgraphCall>,
    errors_by_kind: BTreeMap<String, u64>,
    total_executions: u64,
    total_errors: u64,
}

impl CollectorState {
    fn new(capacity: usize) -> Self {
        Self {
            executions: RingBuffer::new(capacity),
            cache_events: RingBuffer::new(capacity),
            subgraph_calls: RingBuffer::new(capacity),
            errors_by_kind: BTreeMap::new(),
            total_executions: 0,
            total_errors: 0,
        }
    }
}

/// Gauges mirrored from the latest flushed snapshot
struct PrometheusExport {
    registry: Registry,
    executions: IntGaugeVec,
    execution_latency: GaugeVec,
    cache_hit_rate: GaugeVec,
    subgraph_latency: GaugeVec,
    subgraph_error_rate: GaugeVec,
    errors: IntGaugeVec,
}

impl PrometheusExport {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("accelerator".to_string()), None)?;

        let executions = IntGaugeVec::new(
            Opts::new("executions", "Executions in the current window by outcome"),
            &["outcome"],
        )?;
        let execution_latency = GaugeVec::new(
            Opts::new("execution_latency_ms", "Execution latency in milliseconds"),
            &["stat"],
        )?;
        let cache_hit_rate = GaugeVec::new(
            Opts::new("cache_hit_rate", "Cache hit rate per cache"),
            &["cache"],
        )?;
        let subgraph_latency = GaugeVec::new(
            Opts::new("subgraph_latency_ms", "Mean subgraph call latency in milliseconds"),
            &["service"],
        )?;
        let subgraph_error_rate = GaugeVec::new(
            Opts::new("subgraph_error_rate", "Subgraph call error rate"),
            &["service"],
        )?;
        let errors = IntGaugeVec::new(Opts::new("errors", "Errors recorded by kind"), &["kind"])?;

        registry.register(Box::new(executions.clone()))?;
        registry.register(Box::new(execution_latency.clone()))?;
        registry.register(Box::new(cache_hit_rate.clone()))?;
        registry.register(Box::new(subgraph_latency.clone()))?;
        registry.register(Box::new(subgraph_error_rate.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry,
            executions,
            execution_latency,
            cache_hit_rate,
            subgraph_latency,
            subgraph_error_rate,
            errors,
        })
    }

    fn export(&self, snapshot: &PerformanceMetrics) {
        let exec = &snapshot.execution;
        self.executions
            .with_label_values(&["success"])
            .set(exec.successes as i64);
        self.executions
            .with_label_values(&["failure"])
            .set(exec.failures as i64);
        for (stat, value) in [
            ("mean", exec.mean_ms),
            ("p50", exec.p50_ms),
            ("p95", exec.p95_ms),
            ("p99", exec.p99_ms),
        ] {
            self.execution_latency.with_label_values(&[stat]).set(value);
        }

        for (cache, counts) in &snapshot.cache.by_cache {
            self.cache_hit_rate
                .with_label_values(&[cache.as_str()])
                .set(counts.hit_rate);
        }
        for (service, sub) in &snapshot.subgraphs {
            self.subgraph_latency
                .with_label_values(&[service.as_str()])
                .set(sub.mean_latency_ms);
            self.subgraph_error_rate
                .with_label_values(&[service.as_str()])
                .set(sub.error_rate);
        }
        for (kind, count) in &snapshot.errors.by_kind {
            self.errors
                .with_label_values(&[kind.as_str()])
                .set(*count as i64);
        }
    }

    fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(err) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %err, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Ring-buffered recorder of execution, cache, subgraph and error events
pub struct MetricsCollector {
    config: MetricsConfig,
    // SECURITY: Non-poisoning lock
    state: Mutex<CollectorState>,
    started_at: Instant,
    export: Option<PrometheusExport>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        let export = match PrometheusExport::new() {
            Ok(export) => Some(export),
            Err(err) => {
                tracing::warn!(error = %err, "Prometheus export disabled");
                None
            }
        };
        Self {
            state: Mutex::new(CollectorState::new(config.max_buffer_size)),
            config,
            started_at: Instant::now(),
            export,
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Record a successful execution of `operation`
    pub fn record_execution_time(&self, operation: &str, duration: Duration) {
        self.record_execution(operation, duration, true);
    }

    /// Record an execution and whether it succeeded
    pub fn record_execution(&self, operation: &str, duration: Duration, success: bool) {
        if !self.config.enabled || !self.config.collect_execution_metrics {
            return;
        }
        tracing::trace!(operation = %operation, duration_ms = duration.as_millis() as u64, success, "Execution recorded");
        self.absorb(|state| {
            state.total_executions += 1;
            state.executions.push(ExecutionRecord { duration, success });
        });
    }

    /// Count an error against its kind
    pub fn record_error(&self, operation: &str, error: &Error) {
        if !self.config.enabled {
            return;
        }
        let kind = error.kind();
        tracing::debug!(operation = %operation, kind = kind, "Execution error recorded");
        self.absorb(|state| {
            state.total_errors += 1;
            *state.errors_by_kind.entry(kind.to_string()).or_insert(0) += 1;
        });
    }

    pub fn record_cache_hit(&self, cache: &str) {
        self.record_cache_event(cache, true);
    }

    pub fn record_cache_miss(&self, cache: &str) {
        self.record_cache_event(cache, false);
    }

    pub fn record_subgraph_call(&self, call: SubgraphCall) {
        if !self.config.enabled || !self.config.collect_subgraph_metrics {
            return;
        }
        self.absorb(|state| state.subgraph_calls.push(call));
    }

    /// Aggregate the buffered events into a snapshot
    pub fn metrics(&self) -> PerformanceMetrics {
        let state = self.state.lock();
        PerformanceMetrics {
            execution: execution_metrics(&state.executions),
            cache: cache_metrics(&state.cache_events),
            subgraphs: subgraph_metrics(&state.subgraph_calls),
            errors: ErrorMetrics {
                total: state.total_errors,
                by_kind: state.errors_by_kind.clone(),
                error_rate: if state.total_executions == 0 {
                    0.0
                } else {
                    state.total_errors as f64 / state.total_executions as f64
                },
            },
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }

    /// Log and export the current aggregate, then keep only the most recent
    /// entries of each buffer.
    pub fn flush(&self) -> PerformanceMetrics {
        let snapshot = self.metrics();
        tracing::info!(
            executions = snapshot.execution.count,
            failures = snapshot.execution.failures,
            mean_ms = snapshot.execution.mean_ms,
            p95_ms = snapshot.execution.p95_ms,
            cache_hit_rate = snapshot.cache.hit_rate,
            subgraphs = snapshot.subgraphs.len(),
            errors = snapshot.errors.total,
            "Flushing performance metrics"
        );

        if let Some(export) = &self.export {
            let exported =
                std::panic::catch_unwind(AssertUnwindSafe(|| export.export(&snapshot)));
            if exported.is_err() {
                tracing::warn!("Prometheus export panicked; skipping");
            }
        }

        self.absorb(|state| {
            state.executions.retain_recent(RETAINED_AFTER_FLUSH);
            state.cache_events.retain_recent(RETAINED_AFTER_FLUSH);
            state.subgraph_calls.retain_recent(RETAINED_AFTER_FLUSH);
        });
        snapshot
    }

    /// Prometheus text exposition of the last flushed values
    pub fn render_prometheus(&self) -> String {
        self.export.as_ref().map(|e| e.render()).unwrap_or_default()
    }

    /// Drop all buffered events and counters
    pub fn reset(&self) {
        self.absorb(|state| *state = CollectorState::new(self.config.max_buffer_size));
    }

    fn record_cache_event(&self, cache: &str, hit: bool) {
        if !self.config.enabled || !self.config.collect_cache_metrics {
            return;
        }
        self.absorb(|state| {
            state.cache_events.push(CacheEvent {
                cache: cache.to_string(),
                hit,
            })
        });
    }

    /// Run `record` against the state, swallowing any panic
    fn absorb(&self, record: impl FnOnce(&mut CollectorState)) {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let mut state = self.state.lock();
            record(&mut state);
        }));
        if outcome.is_err() {
            tracing::warn!("Metrics recording failed; event dropped");
        }
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MetricsCollector")
            .field("config", &self.config)
            .field("executions", &state.executions.len())
            .field("cache_events", &state.cache_events.len())
            .field("subgraph_calls", &state.subgraph_calls.len())
            .finish()
    }
}

/// Shared metrics collector
pub type SharedMetricsCollector = Arc<MetricsCollector>;

/// Create a new shared metrics collector
pub fn create_metrics_collector(config: MetricsConfig) -> SharedMetricsCollector {
    Arc::new(MetricsCollector::new(config))
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Nearest-rank percentile over an ascending slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * p).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn execution_metrics(buffer: &RingBuffer<ExecutionRecord>) -> ExecutionMetrics {
    let mut durations: Vec<f64> = buffer.iter().map(|r| millis(r.duration)).collect();
    if durations.is_empty() {
        return ExecutionMetrics::default();
    }
    durations.sort_by(|a, b| a.total_cmp(b));
    let successes = buffer.iter().filter(|r| r.success).count();

    ExecutionMetrics {
        count: durations.len(),
        successes,
        failures: durations.len() - successes,
        mean_ms: durations.iter().sum::<f64>() / durations.len() as f64,
        p50_ms: percentile(&durations, 0.50),
        p95_ms: percentile(&durations, 0.95),
        p99_ms: percentile(&durations, 0.99),
        min_ms: durations[0],
        max_ms: durations[durations.len() - 1],
    }
}

fn cache_metrics(buffer: &RingBuffer<CacheEvent>) -> CacheMetrics {
    let mut by_cache: BTreeMap<String, CacheCounts> = BTreeMap::new();
    for event in buffer.iter() {
        let counts = by_cache.entry(event.cache.clone()).or_default();
        if event.hit {
            counts.hits += 1;
        } else {
            counts.misses += 1;
        }
    }
    for counts in by_cache.values_mut() {
        counts.hit_rate = rate(counts.hits, counts.hits + counts.misses);
    }

    let hits = by_cache.values().map(|c| c.hits).sum();
    let misses = by_cache.values().map(|c| c.misses).sum();
    CacheMetrics {
        hits,
        misses,
        hit_rate: rate(hits, hits + misses),
        by_cache,
    }
}

fn subgraph_metrics(buffer: &RingBuffer<SubgraphCall>) -> BTreeMap<String, SubgraphMetrics> {
    let mut totals: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
    for call in buffer.iter() {
        let entry = totals.entry(call.service.clone()).or_default();
        entry.0 += 1;
        if !call.success {
            entry.1 += 1;
        }
        entry.2 += millis(call.duration);
    }
    totals
        .into_iter()
        .map(|(service, (calls, errors, total_ms))| {
            (
                service,
                SubgraphMetrics {
                    calls,
                    errors,
                    mean_latency_ms: total_ms / calls as f64,
                    error_rate: errors as f64 / calls as f64,
                },
            )
        })
        .collect()
}

fn rate(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        n as f64 / total as f64
    }
}
