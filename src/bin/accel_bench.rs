use async_trait::async_trait;
use federation_accelerator::{
    AcceleratorConfig, ExecutionContext, FederatedSchema, KeySource, OptimizedExecutor,
    QueryPlan, QueryStep, StaticPlanner, SubgraphTransport,
};
use serde_json::{json, Value};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const CONCURRENCY: usize = 50;
const DURATION_SECS: u64 = 10;
const SUBGRAPH_LATENCY: Duration = Duration::from_millis(2);

const QUERY: &str = "query Top($first: Int) { topProducts(first: $first) { upc name inStock } }";

/// In-memory subgraphs with a fixed latency per call
struct SimulatedSubgraphs {
    flaky: bool,
    entity_calls: AtomicUsize,
}

#[async_trait]
impl SubgraphTransport for SimulatedSubgraphs {
    async fn execute(
        &self,
        _service: &str,
        _operation: &str,
        variables: &Value,
        _inputs: &Value,
    ) -> anyhow::Result<Value> {
        tokio::time::sleep(SUBGRAPH_LATENCY).await;
        let first = variables.get("first").and_then(Value::as_u64).unwrap_or(5);
        let products: Vec<Value> = (0..first)
            .map(|i| json!({ "upc": i.to_string(), "name": format!("Product {}", i) }))
            .collect();
        Ok(json!({ "topProducts": products }))
    }

    async fn fetch_entities(
        &self,
        service: &str,
        _typename: &str,
        representations: Vec<Value>,
    ) -> anyhow::Result<Vec<Value>> {
        let call = self.entity_calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(SUBGRAPH_LATENCY).await;
        if self.flaky && call % 5 == 0 {
            anyhow::bail!("{} timed out", service);
        }
        Ok(representations
            .iter()
            .map(|rep| json!({ "inStock": rep["upc"] != "0" }))
            .collect())
    }
}

fn top_products_plan() -> QueryPlan {
    QueryPlan::new(vec![
        QueryStep::fetch("top", "products", "{ topProducts { upc name } }"),
        QueryStep::entity_lookup(
            "stock",
            "inventory",
            "Product",
            KeySource::FromDependency {
                step: "top".to_string(),
                pointer: "/topProducts".to_string(),
            },
        )
        .after("top")
        .at_path(["topProducts"]),
    ])
    .with_complexity(2)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let uncached = args.contains(&"--uncached".to_string());
    let flaky = args.contains(&"--flaky".to_string());

    println!("Mode: {}", if uncached { "Uncached (planner on every request)" } else { "Cached plans" });
    println!("Flaky inventory: {}", flaky);
    println!("Concurrency: {}", CONCURRENCY);
    println!("Duration: {} seconds", DURATION_SECS);

    let planner = Arc::new(StaticPlanner::new().with_plan(QUERY, top_products_plan()));
    let transport = Arc::new(SimulatedSubgraphs {
        flaky,
        entity_calls: AtomicUsize::new(0),
    });

    let executor = Arc::new(
        OptimizedExecutor::builder()
            .with_schema(FederatedSchema::new(
                "type Query { topProducts(first: Int): [Product] }",
                vec![],
            ))
            .with_shared_planner(planner.clone())
            .with_shared_transport(transport.clone())
            .with_config(AcceleratorConfig::from_env())
            .build()?,
    );

    let start_time = Instant::now();
    let end_time = start_time + Duration::from_secs(DURATION_SECS);

    let total_requests = Arc::new(AtomicUsize::new(0));
    let total_errors = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CONCURRENCY));

    let mut handles = Vec::new();

    for worker in 0..CONCURRENCY {
        let executor = executor.clone();
        let total_requests = total_requests.clone();
        let total_errors = total_errors.clone();
        let barrier = barrier.clone();

        handles.push(tokio::spawn(async move {
            barrier.wait().await;

            while Instant::now() < end_time {
                let variables = if uncached {
                    json!({ "first": 5, "nonce": Uuid::new_v4().to_string() })
                } else {
                    json!({ "first": 5 + worker % 3 })
                };
                let ctx = ExecutionContext::new().with_operation_name("Top");

                let result = executor.execute(QUERY, &variables, &ctx).await;
                if result.is_ok() {
                    total_requests.fetch_add(1, Ordering::Relaxed);
                } else {
                    total_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let duration = start_time.elapsed();
    let requests = total_requests.load(Ordering::Relaxed);
    let errors = total_errors.load(Ordering::Relaxed);
    let rps = (requests + errors) as f64 / duration.as_secs_f64();

    println!("\nBenchmark Complete!");
    println!("Time taken: {:.2?}", duration);
    println!("Successful Executions: {}", requests);
    println!("Failed Executions: {}", errors);
    println!("Executions/sec: {:.2}", rps);
    println!("Planner calls: {}", planner.calls());
    println!("Entity fetches: {}", transport.entity_calls.load(Ordering::Relaxed));

    println!("\nPlan cache:");
    println!("{}", serde_json::to_string_pretty(&executor.plan_cache().stats())?);
    println!("\nLoaders:");
    println!("{}", serde_json::to_string_pretty(&executor.loaders().stats())?);
    println!("\nCircuit breakers:");
    println!("{}", serde_json::to_string_pretty(&executor.circuit_breakers().summary())?);
    println!("\nMetrics:");
    println!("{}", serde_json::to_string_pretty(&executor.metrics().flush())?);

    if errors > 0 {
        println!("WARNING: There were {} failed executions.", errors);
    }

    Ok(())
}
