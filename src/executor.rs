//! Optimized executor
//!
//! The executor ties the accelerator together. For each request it:
//!
//! 1. Hashes the query and variables into a plan cache key
//! 2. Reuses a cached plan, or asks the [`QueryPlanner`] for one and caches it
//! 3. Runs the plan in dependency waves; steps of a wave run concurrently
//! 4. Routes every remote call through the service's circuit breaker, and
//!    every entity lookup through the service's batching loader
//! 5. Records timings, cache outcome and errors with the metrics collector
//!
//! Failures never escape [`OptimizedExecutor::execute`]: they are reported in
//! the `errors` of the returned [`ExecutionResult`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use federation_accelerator::{
//!     AcceleratorConfig, ExecutionContext, FederatedSchema, OptimizedExecutor, QueryPlan,
//!     QueryStep, StaticPlanner, SubgraphTransport,
//! };
//! use serde_json::{json, Value};
//!
//! struct Http;
//!
//! #[async_trait::async_trait]
//! impl SubgraphTransport for Http {
//!     async fn execute(&self, _: &str, _: &str, _: &Value, _: &Value) -> anyhow::Result<Value> {
//!         Ok(json!({ "me": { "id": "1" } }))
//!     }
//!     async fn fetch_entities(&self, _: &str, _: &str, reps: Vec<Value>) -> anyhow::Result<Vec<Value>> {
//!         Ok(reps)
//!     }
//! }
//!
//! # async fn example() -> federation_accelerator::Result<()> {
//! let planner = StaticPlanner::new().with_plan(
//!     "{ me { id } }",
//!     QueryPlan::new(vec![QueryStep::fetch("me", "accounts", "{ me { id } }")]),
//! );
//!
//! let executor = OptimizedExecutor::builder()
//!     .with_schema(FederatedSchema::new("type Query { me: User }", vec![]))
//!     .with_planner(planner)
//!     .with_transport(Http)
//!     .with_config(AcceleratorConfig::production())
//!     .build()?;
//!
//! let result = executor
//!     .execute("{ me { id } }", &Value::Null, &ExecutionContext::new())
//!     .await;
//! assert!(result.errors.is_empty());
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::{
    create_circuit_breaker_registry, CallError, CircuitBreaker, SharedCircuitBreakerRegistry,
};
use crate::config::AcceleratorConfig;
use crate::dataloader::{create_loader_registry, BatchLoader, EntityKey, SharedLoaderRegistry};
use crate::error::{Error, GraphQLError, Result};
use crate::metrics::{create_metrics_collector, SharedMetricsCollector, SubgraphCall};
use crate::plan::{FederatedSchema, KeySource, QueryPlan, QueryPlanner, QueryStep, StepOperation};
use crate::plan_cache::{create_plan_cache, PlanCache, SharedPlanCache};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Cache name used for plan cache metrics
pub const PLAN_CACHE_NAME: &str = "query_plan";

/// Network seam to the subgraphs
#[async_trait]
pub trait SubgraphTransport: Send + Sync {
    /// Send `operation` to `service`. `inputs` holds the results of the
    /// step's dependencies keyed by step id.
    async fn execute(
        &self,
        service: &str,
        operation: &str,
        variables: &Value,
        inputs: &Value,
    ) -> anyhow::Result<Value>;

    /// Resolve entity representations of one type, returning one value per
    /// representation in the same order
    async fn fetch_entities(
        &self,
        service: &str,
        typename: &str,
        representations: Vec<Value>,
    ) -> anyhow::Result<Vec<Value>>;
}

/// Per-request information
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub operation_name: Option<String>,
    pub request_id: String,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            operation_name: None,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one execution, in GraphQL response shape
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, Value>,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Error codes in reporting order
    pub fn error_codes(&self) -> Vec<&str> {
        self.errors
            .iter()
            .filter_map(|e| e.extensions.get("code").and_then(Value::as_str))
            .collect()
    }
}

/// Executes federated queries through the plan cache, batching loaders and
/// circuit breakers, recording metrics as it goes
pub struct OptimizedExecutor {
    id: Uuid,
    schema: FederatedSchema,
    planner: Arc<dyn QueryPlanner>,
    transport: Arc<dyn SubgraphTransport>,
    plan_cache: SharedPlanCache,
    loaders: SharedLoaderRegistry,
    breakers: SharedCircuitBreakerRegistry,
    metrics: SharedMetricsCollector,
}

impl OptimizedExecutor {
    /// Create a new builder
    pub fn builder() -> OptimizedExecutorBuilder {
        OptimizedExecutorBuilder::new()
    }

    pub fn schema(&self) -> &FederatedSchema {
        &self.schema
    }

    pub fn plan_cache(&self) -> &SharedPlanCache {
        &self.plan_cache
    }

    pub fn loaders(&self) -> &SharedLoaderRegistry {
        &self.loaders
    }

    pub fn circuit_breakers(&self) -> &SharedCircuitBreakerRegistry {
        &self.breakers
    }

    pub fn metrics(&self) -> &SharedMetricsCollector {
        &self.metrics
    }

    /// Execute `query`. Never fails; problems are reported in the result's errors.
    pub async fn execute(
        &self,
        query: &str,
        variables: &Value,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let operation = ctx
            .operation_name
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        let span = tracing::info_span!(
            "federated_execute",
            request_id = %ctx.request_id,
            operation = %operation,
        );

        async {
            let started = Instant::now();
            let (data, errors, cache_hit) = self.execute_inner(query, variables, ctx).await;
            let success = errors.is_empty();

            self.metrics
                .record_execution(&operation, started.elapsed(), success);
            for err in &errors {
                self.metrics.record_error(&operation, err);
            }
            if success {
                tracing::debug!(duration_ms = started.elapsed().as_millis() as u64, "Execution complete");
            } else {
                tracing::debug!(errors = errors.len(), "Execution finished with errors");
            }

            let mut extensions = HashMap::new();
            extensions.insert("requestId".to_string(), Value::String(ctx.request_id.clone()));
            if let Some(hit) = cache_hit {
                extensions.insert("planCacheHit".to_string(), Value::Bool(hit));
            }

            ExecutionResult {
                data,
                errors: errors.iter().map(Error::to_graphql_error).collect(),
                extensions,
            }
        }
        .instrument(span)
        .await
    }

    async fn execute_inner(
        &self,
        query: &str,
        variables: &Value,
        ctx: &ExecutionContext,
    ) -> (Option<Value>, Vec<Error>, Option<bool>) {
        let key = PlanCache::generate_key(query, Some(variables), ctx.operation_name.as_deref());

        let (plan, cache_hit) = match self.plan_cache.get(&key) {
            Some(plan) => {
                self.metrics.record_cache_hit(PLAN_CACHE_NAME);
                (plan, true)
            }
            None => {
                self.metrics.record_cache_miss(PLAN_CACHE_NAME);
                match self.plan(query).await {
                    Ok(plan) => {
                        self.plan_cache.set_for_query(key, query, plan.clone());
                        (plan, false)
                    }
                    Err(err) => return (None, vec![err], Some(false)),
                }
            }
        };

        let (data, errors) = self.run_plan(&plan, variables).await;
        (data, errors, Some(cache_hit))
    }

    /// Plan and validate `query`
    async fn plan(&self, query: &str) -> Result<Arc<QueryPlan>> {
        let plan = self.planner.create_plan(&self.schema, query).await?;
        plan.validate()?;

        if !self.schema.subgraphs().is_empty() {
            if let Some(unknown) = plan
                .services()
                .into_iter()
                .find(|s| !self.schema.has_subgraph(s))
            {
                return Err(Error::InvalidPlan(format!(
                    "plan targets unknown subgraph '{}'",
                    unknown
                )));
            }
        }

        tracing::debug!(
            steps = plan.steps.len(),
            complexity = plan.complexity,
            "Query planned"
        );
        Ok(Arc::new(plan))
    }

    async fn run_plan(&self, plan: &QueryPlan, variables: &Value) -> (Option<Value>, Vec<Error>) {
        let waves = match plan.execution_waves() {
            Ok(waves) => waves,
            Err(err) => return (None, vec![err]),
        };

        let mut data = Value::Object(Map::new());
        let mut results: HashMap<String, Value> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut errors = Vec::new();

        for wave in waves {
            let mut runnable = Vec::with_capacity(wave.len());
            for index in wave {
                let step = &plan.steps[index];
                match step.depends_on.iter().find(|d| failed.contains(*d)) {
                    Some(dependency) => {
                        failed.insert(step.id.clone());
                        errors.push(Error::DependencyFailed {
                            step: step.id.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                    None => runnable.push(step),
                }
            }

            let outcomes =
                join_all(runnable.iter().map(|step| self.run_step(step, variables, &results)))
                    .await;

            for (step, outcome) in runnable.into_iter().zip(outcomes) {
                match outcome {
                    Ok(value) => {
                        merge_at_path(&mut data, &step.path, value.clone());
                        results.insert(step.id.clone(), value);
                    }
                    Err(err) => {
                        tracing::warn!(step = %step.id, service = %step.service, error = %err, "Step failed");
                        failed.insert(step.id.clone());
                        errors.push(err);
                    }
                }
            }

            if !errors.is_empty() && !plan.allow_partial {
                return (None, errors);
            }
        }

        (Some(data), errors)
    }

    async fn run_step(
        &self,
        step: &QueryStep,
        variables: &Value,
        results: &HashMap<String, Value>,
    ) -> Result<Value> {
        let started = Instant::now();
        let outcome = match &step.operation {
            StepOperation::Fetch { operation } => {
                let inputs = dependency_inputs(step, results);
                let breaker = self.breakers.get_or_create(&step.service);
                breaker
                    .execute(|| {
                        self.transport
                            .execute(&step.service, operation, variables, &inputs)
                    })
                    .await
                    .map_err(|err| call_error(&step.service, err))
            }
            StepOperation::EntityLookup { typename, keys } => {
                self.lookup_entities(step, typename, keys, results).await
            }
        };

        let call = match &outcome {
            Ok(_) => SubgraphCall::success(&step.service, &step.id, started.elapsed()),
            Err(err) => SubgraphCall::failure(&step.service, &step.id, started.elapsed(), err.kind()),
        };
        self.metrics.record_subgraph_call(call);
        outcome
    }

    async fn lookup_entities(
        &self,
        step: &QueryStep,
        typename: &str,
        source: &KeySource,
        results: &HashMap<String, Value>,
    ) -> Result<Value> {
        let (items, single) = match source {
            KeySource::Static { representations } => (representations.clone(), false),
            KeySource::FromDependency { step: dep, pointer } => {
                let source = results.get(dep).ok_or_else(|| {
                    Error::Internal(format!("result of step '{}' is missing", dep))
                })?;
                match source.pointer(pointer) {
                    None | Some(Value::Null) => (Vec::new(), false),
                    Some(Value::Array(items)) => (items.clone(), false),
                    Some(object @ Value::Object(_)) => (vec![object.clone()], true),
                    Some(other) => {
                        return Err(Error::InvalidPlan(format!(
                            "pointer '{}' of step '{}' resolved to {} instead of entities",
                            pointer, step.id, other
                        )))
                    }
                }
            }
        };

        // Null items keep their slot so the result lines up with the parent list
        let present: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.is_null())
            .map(|(i, _)| i)
            .collect();
        let mut resolved = vec![Value::Null; items.len()];

        if !present.is_empty() {
            let keys = present
                .iter()
                .map(|&i| EntityKey::new(typename, items[i].clone()))
                .collect();
            let values = self.entity_loader(&step.service).load_many(keys).await?;
            for (i, value) in present.into_iter().zip(values) {
                resolved[i] = value;
            }
        }

        if single {
            Ok(resolved.pop().unwrap_or(Value::Null))
        } else {
            Ok(Value::Array(resolved))
        }
    }

    /// The entity loader for `service`. Every call site shares this closure
    /// type, and loaders are scoped to this executor, so a shared registry
    /// never routes one executor's lookups through another's transport.
    fn entity_loader(&self, service: &str) -> Arc<BatchLoader<EntityKey, Value>> {
        let transport = self.transport.clone();
        let breaker = self.breakers.get_or_create(service);
        let service_name = service.to_string();
        self.loaders
            .get_scoped_loader(self.id, service, move |keys: Vec<EntityKey>| {
                let transport = transport.clone();
                let breaker = breaker.clone();
                let service = service_name.clone();
                async move { fetch_entity_batch(transport.as_ref(), &breaker, &service, keys).await }
            })
    }
}

impl std::fmt::Debug for OptimizedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizedExecutor")
            .field("subgraphs", &self.schema.subgraphs().len())
            .field("plan_cache", &self.plan_cache)
            .field("loaders", &self.loaders)
            .field("breakers", &self.breakers)
            .finish()
    }
}

/// Resolve one batch of entity keys with a single breaker-guarded call.
///
/// Keys are grouped by type name (first-seen order) and each group is sent to
/// the transport in turn; values are returned in key order.
async fn fetch_entity_batch(
    transport: &dyn SubgraphTransport,
    breaker: &CircuitBreaker,
    service: &str,
    keys: Vec<EntityKey>,
) -> anyhow::Result<Vec<Value>> {
    let mut groups: Vec<(&str, Vec<usize>)> = Vec::new();
    for (index, key) in keys.iter().enumerate() {
        match groups.iter_mut().find(|(typename, _)| *typename == key.typename()) {
            Some((_, indices)) => indices.push(index),
            None => groups.push((key.typename(), vec![index])),
        }
    }

    let fetched = breaker
        .execute(|| async {
            let mut values = vec![Value::Null; keys.len()];
            for (typename, indices) in &groups {
                let representations = indices
                    .iter()
                    .map(|&i| keys[i].representation().clone())
                    .collect();
                let resolved = transport
                    .fetch_entities(service, typename, representations)
                    .await?;
                if resolved.len() != indices.len() {
                    anyhow::bail!(
                        "'{}' resolved {} of {} {} entities",
                        service,
                        resolved.len(),
                        indices.len(),
                        typename
                    );
                }
                for (&i, value) in indices.iter().zip(resolved) {
                    values[i] = value;
                }
            }
            Ok::<_, anyhow::Error>(values)
        })
        .await;

    fetched.map_err(|err| match err {
        CallError::Rejected(open) => anyhow::Error::new(open),
        CallError::Failed(err) => err,
        other => anyhow::anyhow!(other.to_string()),
    })
}

fn call_error(service: &str, err: CallError<anyhow::Error>) -> Error {
    match err {
        CallError::Rejected(open) => Error::CircuitOpen(open),
        CallError::Failed(err) => Error::subgraph(service, format!("{:#}", err)),
        other => Error::subgraph(service, other.to_string()),
    }
}

/// Results of `step`'s dependencies keyed by step id
fn dependency_inputs(step: &QueryStep, results: &HashMap<String, Value>) -> Value {
    Value::Object(
        step.depends_on
            .iter()
            .filter_map(|dep| results.get(dep).map(|v| (dep.clone(), v.clone())))
            .collect(),
    )
}

/// Merge `value` into `target` at `path`, creating objects along the way
fn merge_at_path(target: &mut Value, path: &[String], value: Value) {
    let mut cursor = target;
    for segment in path {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Some(map) = cursor.as_object_mut() else {
            return;
        };
        cursor = map.entry(segment.clone()).or_insert(Value::Null);
    }
    deep_merge(cursor, value);
}

/// Objects merge key by key, equal-length lists merge element-wise, anything
/// else is replaced
fn deep_merge(target: &mut Value, value: Value) {
    match (target, value) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(existing), Value::Array(incoming)) if existing.len() == incoming.len() => {
            for (slot, value) in existing.iter_mut().zip(incoming) {
                deep_merge(slot, value);
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Builder for [`OptimizedExecutor`]
///
/// Collaborators that are not supplied are created from the configuration.
pub struct OptimizedExecutorBuilder {
    schema: Option<FederatedSchema>,
    planner: Option<Arc<dyn QueryPlanner>>,
    transport: Option<Arc<dyn SubgraphTransport>>,
    config: AcceleratorConfig,
    plan_cache: Option<SharedPlanCache>,
    loaders: Option<SharedLoaderRegistry>,
    breakers: Option<SharedCircuitBreakerRegistry>,
    metrics: Option<SharedMetricsCollector>,
}

impl OptimizedExecutorBuilder {
    pub fn new() -> Self {
        Self {
            schema: None,
            planner: None,
            transport: None,
            config: AcceleratorConfig::default(),
            plan_cache: None,
            loaders: None,
            breakers: None,
            metrics: None,
        }
    }

    pub fn with_schema(mut self, schema: FederatedSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_planner<P: QueryPlanner + 'static>(self, planner: P) -> Self {
        self.with_shared_planner(Arc::new(planner))
    }

    pub fn with_shared_planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_transport<T: SubgraphTransport + 'static>(self, transport: T) -> Self {
        self.with_shared_transport(Arc::new(transport))
    }

    pub fn with_shared_transport(mut self, transport: Arc<dyn SubgraphTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Configuration for the collaborators built by [`Self::build`]
    pub fn with_config(mut self, config: AcceleratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_plan_cache(mut self, cache: SharedPlanCache) -> Self {
        self.plan_cache = Some(cache);
        self
    }

    pub fn with_loader_registry(mut self, loaders: SharedLoaderRegistry) -> Self {
        self.loaders = Some(loaders);
        self
    }

    pub fn with_circuit_breakers(mut self, breakers: SharedCircuitBreakerRegistry) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<OptimizedExecutor> {
        self.config.validate()?;

        let schema = self
            .schema
            .ok_or_else(|| Error::Config("executor requires a federated schema".to_string()))?;
        let planner = self
            .planner
            .ok_or_else(|| Error::Config("executor requires a query planner".to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("executor requires a subgraph transport".to_string()))?;

        let config = self.config;
        Ok(OptimizedExecutor {
            id: Uuid::new_v4(),
            schema,
            planner,
            transport,
            plan_cache: self
                .plan_cache
                .unwrap_or_else(|| create_plan_cache(config.query_plan_cache.clone())),
            loaders: self
                .loaders
                .unwrap_or_else(|| create_loader_registry(config.data_loader.clone())),
            breakers: self
                .breakers
                .unwrap_or_else(|| create_circuit_breaker_registry(config.circuit_breaker.clone())),
            metrics: self
                .metrics
                .unwrap_or_else(|| create_metrics_collector(config.metrics.clone())),
        })
    }
}

impl Default for OptimizedExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::plan::{StaticPlanner, SubgraphDefinition};
    use serde_json::json;

    #[derive(Default)]
    struct MockTransport {
        responses: HashMap<String, Value>,
        down: HashSet<String>,
        executed: parking_lot::Mutex<Vec<String>>,
        entity_batches: parking_lot::Mutex<Vec<(String, String, usize)>>,
    }

    impl MockTransport {
        fn respond(mut self, service: &str, response: Value) -> Self {
            self.responses.insert(service.to_string(), response);
            self
        }

        fn down(mut self, service: &str) -> Self {
            self.down.insert(service.to_string());
            self
        }
    }

    #[async_trait]
    impl SubgraphTransport for MockTransport {
        async fn execute(
            &self,
            service: &str,
            _operation: &str,
            _variables: &Value,
            _inputs: &Value,
        ) -> anyhow::Result<Value> {
            self.executed.lock().push(service.to_string());
            if self.down.contains(service) {
                anyhow::bail!("{} is down", service);
            }
            Ok(self.responses.get(service).cloned().unwrap_or(Value::Null))
        }

        async fn fetch_entities(
            &self,
            service: &str,
            typename: &str,
            representations: Vec<Value>,
        ) -> anyhow::Result<Vec<Value>> {
            self.entity_batches.lock().push((
                service.to_string(),
                typename.to_string(),
                representations.len(),
            ));
            if self.down.contains(service) {
                anyhow::bail!("{} is down", service);
            }
            Ok(representations
                .into_iter()
                .map(|rep| json!({ "inStock": rep["upc"] != "3" }))
                .collect())
        }
    }

    const QUERY: &str = "{ top { upc inStock } }";

    fn products_plan() -> QueryPlan {
        QueryPlan::new(vec![
            QueryStep::fetch("products", "products", "{ top { upc } }"),
            QueryStep::entity_lookup(
                "inventory",
                "inventory",
                "Product",
                KeySource::FromDependency {
                    step: "products".to_string(),
                    pointer: "/top".to_string(),
                },
            )
            .after("products")
            .at_path(["top"]),
        ])
    }

    fn products_transport() -> MockTransport {
        MockTransport::default().respond(
            "products",
            json!({ "top": [{ "upc": "1" }, { "upc": "2" }, { "upc": "3" }] }),
        )
    }

    fn executor(plan: QueryPlan, transport: Arc<MockTransport>) -> OptimizedExecutor {
        OptimizedExecutor::builder()
            .with_schema(FederatedSchema::new("type Query { top: [Product] }", vec![]))
            .with_planner(StaticPlanner::new().with_plan(QUERY, plan))
            .with_shared_transport(transport)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_entities_merged_into_parent_list() {
        let transport = Arc::new(products_transport());
        let executor = executor(products_plan(), transport.clone());

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;

        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(
            result.data,
            Some(json!({ "top": [
                { "upc": "1", "inStock": true },
                { "upc": "2", "inStock": true },
                { "upc": "3", "inStock": false },
            ]}))
        );
        assert_eq!(
            transport.entity_batches.lock().as_slice(),
            &[("inventory".to_string(), "Product".to_string(), 3)]
        );
        assert_eq!(result.extensions["planCacheHit"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookups_in_same_wave_share_one_batch() {
        let plan = QueryPlan::new(vec![
            QueryStep::entity_lookup(
                "a",
                "inventory",
                "Product",
                KeySource::Static {
                    representations: vec![json!({"upc": "1"}), json!({"upc": "2"})],
                },
            )
            .at_path(["first"]),
            QueryStep::entity_lookup(
                "b",
                "inventory",
                "Product",
                KeySource::Static {
                    representations: vec![json!({"upc": "2"}), json!({"upc": "3"})],
                },
            )
            .at_path(["second"]),
        ]);
        let transport = Arc::new(MockTransport::default());
        let executor = executor(plan, transport.clone());

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;

        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(
            transport.entity_batches.lock().as_slice(),
            &[("inventory".to_string(), "Product".to_string(), 3)]
        );
        let stats = executor.loaders().stats();
        assert_eq!(stats["inventory"].dedup_hits, 1);
        assert_eq!(result.data.unwrap()["second"][1]["inStock"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_partial_results() {
        let transport = Arc::new(products_transport().down("inventory"));
        let executor = executor(products_plan(), transport);

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;

        assert!(result.data.is_none());
        assert_eq!(result.error_codes(), vec!["BATCH_ERROR"]);
        assert_eq!(result.errors[0].extensions["service"], "inventory");

        let metrics = executor.metrics().metrics();
        assert_eq!(metrics.execution.failures, 1);
        assert_eq!(metrics.subgraphs["inventory"].errors, 1);
        assert_eq!(metrics.subgraphs["products"].errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_skip_dependents() {
        let plan = QueryPlan::new(vec![
            QueryStep::fetch("me", "accounts", "{ me { id } }").at_path(["me"]),
            QueryStep::fetch("products", "products", "{ top { upc } }"),
            QueryStep::fetch("reviews", "reviews", "{ reviews }")
                .after("products")
                .at_path(["reviews"]),
        ])
        .with_partial_results(true);
        let transport = Arc::new(
            MockTransport::default()
                .respond("accounts", json!({ "id": "u1" }))
                .down("products"),
        );
        let executor = executor(plan, transport.clone());

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;

        assert_eq!(result.data, Some(json!({ "me": { "id": "u1" } })));
        assert_eq!(result.error_codes(), vec!["SUBGRAPH_ERROR", "DEPENDENCY_FAILED"]);
        assert!(!transport.executed.lock().contains(&"reviews".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_rejects_without_calling() {
        let transport = Arc::new(products_transport().down("products"));
        let executor = OptimizedExecutor::builder()
            .with_schema(FederatedSchema::new("type Query { top: [Product] }", vec![]))
            .with_planner(StaticPlanner::new().with_plan(QUERY, products_plan()))
            .with_shared_transport(transport.clone())
            .with_config(AcceleratorConfig::default().with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            }))
            .build()
            .unwrap();

        for _ in 0..2 {
            let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;
            assert_eq!(result.error_codes(), vec!["SUBGRAPH_ERROR"]);
        }
        assert_eq!(
            executor.circuit_breakers().status().get("products"),
            Some(&CircuitState::Open)
        );

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;
        assert_eq!(result.error_codes(), vec!["SERVICE_UNAVAILABLE"]);
        assert_eq!(transport.executed.lock().len(), 2);

        let errors = executor.metrics().metrics().errors;
        assert_eq!(errors.by_kind["subgraph"], 2);
        assert_eq!(errors.by_kind["circuit_open"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_plan_is_reported_and_not_cached() {
        let plan = QueryPlan::new(vec![QueryStep::fetch("a", "products", "{ a }").after("nope")]);
        let executor = executor(plan, Arc::new(MockTransport::default()));

        for _ in 0..2 {
            let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;
            assert!(result.data.is_none());
            assert_eq!(result.error_codes(), vec!["INVALID_PLAN"]);
        }
        assert!(executor.plan_cache().is_empty());
        assert_eq!(executor.plan_cache().stats().misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_list_items_keep_their_slot() {
        let transport = Arc::new(MockTransport::default().respond(
            "products",
            json!({ "top": [{ "upc": "1" }, null, { "upc": "3" }] }),
        ));
        let executor = executor(products_plan(), transport.clone());

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;

        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(
            result.data,
            Some(json!({ "top": [
                { "upc": "1", "inStock": true },
                null,
                { "upc": "3", "inStock": false },
            ]}))
        );
        assert_eq!(
            transport.entity_batches.lock().as_slice(),
            &[("inventory".to_string(), "Product".to_string(), 2)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_source_outside_dependencies_is_not_cached() {
        let plan = QueryPlan::new(vec![
            QueryStep::fetch("products", "products", "{ top { upc } }"),
            QueryStep::entity_lookup(
                "inventory",
                "inventory",
                "Product",
                KeySource::FromDependency {
                    step: "products".to_string(),
                    pointer: "/top".to_string(),
                },
            )
            .at_path(["top"]),
        ]);
        let transport = Arc::new(products_transport());
        let executor = executor(plan, transport.clone());

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;

        assert_eq!(result.error_codes(), vec!["INVALID_PLAN"]);
        assert!(executor.plan_cache().is_empty());
        assert!(transport.executed.lock().is_empty());
    }

    struct TaggedTransport(&'static str);

    #[async_trait]
    impl SubgraphTransport for TaggedTransport {
        async fn execute(&self, _: &str, _: &str, _: &Value, _: &Value) -> anyhow::Result<Value> {
            Ok(Value::Null)
        }

        async fn fetch_entities(
            &self,
            _service: &str,
            _typename: &str,
            representations: Vec<Value>,
        ) -> anyhow::Result<Vec<Value>> {
            Ok(representations.iter().map(|_| json!({ "by": self.0 })).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_executors_sharing_loaders_use_their_own_transport() {
        let plan = QueryPlan::new(vec![QueryStep::entity_lookup(
            "items",
            "inventory",
            "Product",
            KeySource::Static {
                representations: vec![json!({ "upc": "1" })],
            },
        )
        .at_path(["items"])]);
        let loaders = create_loader_registry(Default::default());
        let build = |tag: &'static str| {
            OptimizedExecutor::builder()
                .with_schema(FederatedSchema::new("type Query { items: [Product] }", vec![]))
                .with_planner(StaticPlanner::new().with_plan(QUERY, plan.clone()))
                .with_transport(TaggedTransport(tag))
                .with_loader_registry(loaders.clone())
                .build()
                .unwrap()
        };
        let (a, b) = (build("a"), build("b"));

        let from_a = a.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;
        let from_b = b.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;

        assert_eq!(from_a.data.unwrap()["items"][0]["by"], "a");
        assert_eq!(from_b.data.unwrap()["items"][0]["by"], "b");
        assert_eq!(loaders.len(), 2);
        assert_eq!(loaders.stats()["inventory"].loads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_subgraph_rejected() {
        let executor = OptimizedExecutor::builder()
            .with_schema(FederatedSchema::new(
                "type Query { top: [Product] }",
                vec![SubgraphDefinition {
                    name: "products".to_string(),
                    url: "http://products".to_string(),
                }],
            ))
            .with_planner(StaticPlanner::new().with_plan(QUERY, products_plan()))
            .with_transport(products_transport())
            .build()
            .unwrap();

        let result = executor.execute(QUERY, &Value::Null, &ExecutionContext::new()).await;
        assert_eq!(result.error_codes(), vec!["INVALID_PLAN"]);
        assert!(result.errors[0].message.contains("inventory"));
    }

    #[tokio::test]
    async fn test_planning_failure() {
        let executor = executor(products_plan(), Arc::new(MockTransport::default()));

        let result = executor
            .execute("{ unknown }", &Value::Null, &ExecutionContext::new().with_request_id("r-1"))
            .await;
        assert!(result.data.is_none());
        assert_eq!(result.error_codes(), vec!["PLANNING_ERROR"]);
        assert_eq!(result.extensions["requestId"], "r-1");
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = OptimizedExecutor::builder()
            .with_planner(StaticPlanner::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("schema")));
    }

    #[test]
    fn test_merge_at_path() {
        let mut data = json!({ "top": [{ "upc": "1" }] });
        merge_at_path(
            &mut data,
            &["top".to_string()],
            json!([{ "price": 10 }]),
        );
        merge_at_path(&mut data, &["meta".to_string(), "count".to_string()], json!(1));
        merge_at_path(&mut data, &[], json!({ "extra": true }));

        assert_eq!(
            data,
            json!({
                "top": [{ "upc": "1", "price": 10 }],
                "meta": { "count": 1 },
                "extra": true
            })
        );
    }

    #[test]
    fn test_result_serialization() {
        let result = ExecutionResult {
            data: Some(json!({ "a": 1 })),
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json, json!({ "data": { "a": 1 } }));
    }
}
