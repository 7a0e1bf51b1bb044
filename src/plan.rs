//! Query plans and the planner seam
//!
//! A [`QueryPlan`] is the cacheable output of planning a federated query: an
//! ordered list of [`QueryStep`]s, each targeting one subgraph, with explicit
//! dependencies between steps. Plans carry no per-request state and are shared
//! as `Arc<QueryPlan>` between the cache and concurrent executions.
//!
//! Planning itself is delegated to a [`QueryPlanner`] implementation. The
//! bundled [`StaticPlanner`] serves pre-registered plans and is handy for
//! tests and benchmarks.

use crate::error::{Error, Result};
use crate::plan_cache::normalize_query;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where an entity lookup gets its representations from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum KeySource {
    /// Representations known when the plan was built
    Static { representations: Vec<Value> },
    /// Representations read out of a dependency's result with a JSON pointer.
    ///
    /// The pointer may resolve to a single object or to an array of objects.
    FromDependency { step: String, pointer: String },
}

/// The work a step performs against its service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StepOperation {
    /// Send an operation document to the service
    Fetch { operation: String },
    /// Resolve entities of `typename` through the service's batching loader
    EntityLookup { typename: String, keys: KeySource },
}

/// One unit of work inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStep {
    pub id: String,
    pub service: String,
    pub operation: StepOperation,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Location in the response object where this step's result is merged.
    /// Empty merges at the root.
    #[serde(default)]
    pub path: Vec<String>,
}

impl QueryStep {
    /// A step that sends `operation` to `service`
    pub fn fetch(id: impl Into<String>, service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            operation: StepOperation::Fetch {
                operation: operation.into(),
            },
            depends_on: Vec::new(),
            path: Vec::new(),
        }
    }

    /// A step that resolves `typename` entities on `service`
    pub fn entity_lookup(
        id: impl Into<String>,
        service: impl Into<String>,
        typename: impl Into<String>,
        keys: KeySource,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            operation: StepOperation::EntityLookup {
                typename: typename.into(),
                keys,
            },
            depends_on: Vec::new(),
            path: Vec::new(),
        }
    }

    /// Add a dependency on another step
    pub fn after(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Merge the result under `path` in the response
    pub fn at_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }
}

/// An immutable, cacheable execution plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub steps: Vec<QueryStep>,
    #[serde(default)]
    pub complexity: u32,
    #[serde(default)]
    pub estimated_cost: f64,
    /// Keep going after a step fails, skipping only its dependents
    #[serde(default)]
    pub allow_partial: bool,
}

impl QueryPlan {
    pub fn new(steps: Vec<QueryStep>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn with_complexity(mut self, complexity: u32) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_partial_results(mut self, allow: bool) -> Self {
        self.allow_partial = allow;
        self
    }

    /// Look a step up by id
    pub fn step(&self, id: &str) -> Option<&QueryStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Distinct services in first-use order
    pub fn services(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .map(|s| s.service.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// Check step ids are unique, dependencies exist, entity keys come from a
    /// declared dependency and there are no cycles
    pub fn validate(&self) -> Result<()> {
        self.execution_waves().map(|_| ())
    }

    /// Group step indices into waves; every step's dependencies live in earlier waves.
    ///
    /// Within a wave, steps keep their plan order.
    pub fn execution_waves(&self) -> Result<Vec<Vec<usize>>> {
        let mut index = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(Error::InvalidPlan(format!("duplicate step id '{}'", step.id)));
            }
        }

        let mut remaining = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            let mut unique = HashSet::new();
            for dep in &step.depends_on {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(Error::InvalidPlan(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                };
                if unique.insert(d) {
                    remaining[i] += 1;
                    dependents[d].push(i);
                }
            }
            if let StepOperation::EntityLookup {
                keys: KeySource::FromDependency { step: source, .. },
                ..
            } = &step.operation
            {
                if !step.depends_on.contains(source) {
                    return Err(Error::InvalidPlan(format!(
                        "step '{}' reads keys from '{}' without depending on it",
                        step.id, source
                    )));
                }
            }
        }

        let mut waves = Vec::new();
        let mut ready: Vec<usize> = (0..self.steps.len()).filter(|&i| remaining[i] == 0).collect();
        let mut scheduled = 0;
        while !ready.is_empty() {
            scheduled += ready.len();
            let mut next = Vec::new();
            for &i in &ready {
                for &dependent in &dependents[i] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            waves.push(std::mem::replace(&mut ready, next));
        }

        if scheduled != self.steps.len() {
            let stuck: Vec<&str> = (0..self.steps.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| self.steps[i].id.as_str())
                .collect();
            return Err(Error::InvalidPlan(format!(
                "dependency cycle between steps {:?}",
                stuck
            )));
        }
        Ok(waves)
    }
}

/// A subgraph that is part of the composed schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphDefinition {
    pub name: String,
    pub url: String,
}

/// Handle to a composed supergraph. Composition happens elsewhere.
#[derive(Debug, Clone)]
pub struct FederatedSchema {
    supergraph_sdl: Arc<str>,
    subgraphs: Vec<SubgraphDefinition>,
}

impl FederatedSchema {
    pub fn new(supergraph_sdl: impl Into<Arc<str>>, subgraphs: Vec<SubgraphDefinition>) -> Self {
        Self {
            supergraph_sdl: supergraph_sdl.into(),
            subgraphs,
        }
    }

    pub fn supergraph_sdl(&self) -> &str {
        &self.supergraph_sdl
    }

    pub fn subgraphs(&self) -> &[SubgraphDefinition] {
        &self.subgraphs
    }

    pub fn has_subgraph(&self, name: &str) -> bool {
        self.subgraphs.iter().any(|s| s.name == name)
    }
}

/// Turns a query into a plan against a schema
#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn create_plan(&self, schema: &FederatedSchema, query: &str) -> Result<QueryPlan>;
}

/// Planner serving plans registered up front, keyed by whitespace-normalized query
#[derive(Default)]
pub struct StaticPlanner {
    plans: RwLock<HashMap<String, QueryPlan>>,
    calls: AtomicU64,
}

impl StaticPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the plan returned for `query`
    pub fn with_plan(self, query: &str, plan: QueryPlan) -> Self {
        self.register(query, plan);
        self
    }

    pub fn register(&self, query: &str, plan: QueryPlan) {
        self.plans.write().insert(normalize_query(query), plan);
    }

    /// Number of times `create_plan` has been invoked
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueryPlanner for StaticPlanner {
    async fn create_plan(&self, _schema: &FederatedSchema, query: &str) -> Result<QueryPlan> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.plans
            .read()
            .get(&normalize_query(query))
            .cloned()
            .ok_or_else(|| Error::Planning(format!("no plan registered for query '{}'", query.trim())))
    }
}

impl std::fmt::Debug for StaticPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPlanner")
            .field("plans", &self.plans.read().len())
            .field("calls", &self.calls())
            .finish()
    }
}
