//! Per-service batching loader
//!
//! Entity lookups against a subgraph tend to arrive one key at a time while a
//! plan fans out. A [`BatchLoader`] collects the keys requested during a short
//! window and resolves them with a single call to an injected fetch function,
//! preventing N+1 round trips.
//!
//! - Keys requested while an identical key is pending or in flight join that
//!   key's result instead of being fetched again.
//! - A batch is dispatched when it reaches `max_batch_size` keys or when
//!   `batch_window` elapses after its first key, whichever comes first.
//! - The fetch function must return one value per key, in key order.
//! - A failed fetch fails every waiter of that batch with the same error.
//!
//! Loaders are owned by a [`LoaderRegistry`], which hands out one loader per
//! service and fetch function.
//!
//! ## Example
//!
//! ```rust,no_run
//! use federation_accelerator::{DataLoaderConfig, LoaderRegistry};
//!
//! async fn fetch_users(ids: Vec<u64>) -> anyhow::Result<Vec<String>> {
//!     Ok(ids.iter().map(|id| format!("user-{}", id)).collect())
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = LoaderRegistry::new(DataLoaderConfig::default());
//! let loader = registry.get_loader("accounts", fetch_users);
//!
//! let (a, b) = tokio::join!(loader.load(1), loader.load(2));
//! assert_eq!(a?, "user-1");
//! assert_eq!(b?, "user-2");
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::CircuitBreakerError;
use ahash::AHashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Batching configuration shared by every loader of a registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataLoaderConfig {
    /// Dispatch as soon as this many distinct keys are pending
    pub max_batch_size: usize,
    /// Longest time the first key of a batch waits for company
    #[serde(rename = "batchWindowMs", with = "crate::config::duration_ms")]
    pub batch_window: Duration,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_window: Duration::from_millis(10),
        }
    }
}

/// Failure delivered to the waiters of a batch
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoaderError {
    #[error("Batch load from '{service}' failed: {message}")]
    BatchFailed { service: String, message: String },

    #[error("Batch load from '{service}' returned {actual} values for {expected} keys")]
    LengthMismatch {
        service: String,
        expected: usize,
        actual: usize,
    },

    /// The fetch function was rejected by an open circuit
    #[error(transparent)]
    CircuitOpen(CircuitBreakerError),

    #[error("Loader for '{service}' was cleared before the batch completed")]
    Cleared { service: String },
}

impl LoaderError {
    /// Service whose loader produced the error
    pub fn service(&self) -> &str {
        match self {
            LoaderError::BatchFailed { service, .. }
            | LoaderError::LengthMismatch { service, .. }
            | LoaderError::Cleared { service } => service,
            LoaderError::CircuitOpen(CircuitBreakerError::CircuitOpen { service, .. }) => service,
        }
    }

    fn from_fetch(service: &str, err: anyhow::Error) -> Self {
        match err.downcast_ref::<CircuitBreakerError>() {
            Some(open) => LoaderError::CircuitOpen(open.clone()),
            None => LoaderError::BatchFailed {
                service: service.to_string(),
                message: format!("{:#}", err),
            },
        }
    }
}

/// Type-erased fetch function
pub type BatchFn<K, V> =
    Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, anyhow::Result<Vec<V>>> + Send + Sync>;

type Outcome<V> = Option<Result<V, LoaderError>>;

struct LoaderState<K, V> {
    /// Keys waiting for the next dispatch, in first-seen order
    pending: Vec<K>,
    /// Result channel per pending or in-flight key
    waiters: HashMap<K, watch::Sender<Outcome<V>>>,
    /// Bumped whenever `pending` is taken; stale window timers compare against it
    generation: u64,
    closed: bool,
    tasks: Vec<AbortHandle>,
}

impl<K, V> LoaderState<K, V> {
    fn track(&mut self, handle: AbortHandle) {
        self.tasks.retain(|h| !h.is_finished());
        self.tasks.push(handle);
    }
}

/// Raw counters of one loader
#[derive(Debug, Clone, Copy, Default)]
struct LoaderCounters {
    loads: u64,
    batches: u64,
    total_keys: u64,
    dedup_hits: u64,
}

impl std::ops::Add for LoaderCounters {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            loads: self.loads + other.loads,
            batches: self.batches + other.batches,
            total_keys: self.total_keys + other.total_keys,
            dedup_hits: self.dedup_hits + other.dedup_hits,
        }
    }
}

/// Batching statistics for one service
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderStats {
    pub service: String,
    pub loads: u64,
    pub batches: u64,
    pub total_keys: u64,
    pub dedup_hits: u64,
    pub avg_batch_size: f64,
    /// Loads that joined an already pending key, over all loads
    pub cache_hit_rate: f64,
}

impl LoaderStats {
    fn from_counters(service: &str, c: LoaderCounters) -> Self {
        Self {
            service: service.to_string(),
            loads: c.loads,
            batches: c.batches,
            total_keys: c.total_keys,
            dedup_hits: c.dedup_hits,
            avg_batch_size: ratio(c.total_keys, c.batches),
            cache_hit_rate: ratio(c.dedup_hits, c.loads),
        }
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

/// Batches and de-duplicates loads of `K` into calls of one fetch function
pub struct BatchLoader<K, V> {
    service: String,
    config: DataLoaderConfig,
    fetch: BatchFn<K, V>,
    state: Mutex<LoaderState<K, V>>,
    loads: AtomicU64,
    batches: AtomicU64,
    total_keys: AtomicU64,
    dedup_hits: AtomicU64,
}

impl<K, V> BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a standalone loader. Most callers go through [`LoaderRegistry`].
    pub fn new<F, Fut>(service: impl Into<String>, config: DataLoaderConfig, fetch: F) -> Arc<Self>
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'static,
    {
        let fetch: BatchFn<K, V> = Arc::new(move |keys| fetch(keys).boxed());
        Arc::new(Self {
            service: service.into(),
            config,
            fetch,
            state: Mutex::new(LoaderState {
                pending: Vec::new(),
                waiters: HashMap::new(),
                generation: 0,
                closed: false,
                tasks: Vec::new(),
            }),
            loads: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            total_keys: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Load a single key
    pub async fn load(self: &Arc<Self>, key: K) -> Result<V, LoaderError> {
        let mut receivers = self.enqueue(std::iter::once(key))?;
        match receivers.pop() {
            Some(rx) => self.wait(rx).await,
            None => Err(self.cleared()),
        }
    }

    /// Load several keys; values come back in request order.
    ///
    /// All keys join the current window together, so they are fetched in as
    /// few dispatches as the batch size allows.
    pub async fn load_many(self: &Arc<Self>, keys: Vec<K>) -> Result<Vec<V>, LoaderError> {
        let receivers = self.enqueue(keys)?;
        join_all(receivers.into_iter().map(|rx| self.wait(rx)))
            .await
            .into_iter()
            .collect()
    }

    /// Current counters for this loader
    pub fn stats(&self) -> LoaderStats {
        LoaderStats::from_counters(&self.service, self.counters())
    }

    fn counters(&self) -> LoaderCounters {
        LoaderCounters {
            loads: self.loads.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            total_keys: self.total_keys.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
        }
    }

    fn enqueue(
        self: &Arc<Self>,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<Vec<watch::Receiver<Outcome<V>>>, LoaderError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(self.cleared());
        }

        let window_open = !state.pending.is_empty();
        let mut receivers = Vec::new();
        for key in keys {
            self.loads.fetch_add(1, Ordering::Relaxed);
            if let Some(tx) = state.waiters.get(&key) {
                self.dedup_hits.fetch_add(1, Ordering::Relaxed);
                receivers.push(tx.subscribe());
                continue;
            }
            let (tx, rx) = watch::channel(None);
            state.waiters.insert(key.clone(), tx);
            state.pending.push(key);
            receivers.push(rx);
        }

        if state.pending.len() >= self.config.max_batch_size.max(1) {
            let keys = std::mem::take(&mut state.pending);
            state.generation += 1;
            let handle = tokio::spawn(self.clone().dispatch(keys)).abort_handle();
            state.track(handle);
        } else if !window_open && !state.pending.is_empty() {
            let generation = state.generation;
            let loader = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(loader.config.batch_window).await;
                let keys = {
                    let mut state = loader.state.lock();
                    if state.generation != generation || state.pending.is_empty() {
                        return;
                    }
                    state.generation += 1;
                    std::mem::take(&mut state.pending)
                };
                loader.dispatch(keys).await;
            })
            .abort_handle();
            state.track(handle);
        }

        Ok(receivers)
    }

    async fn wait(&self, mut rx: watch::Receiver<Outcome<V>>) -> Result<V, LoaderError> {
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or_else(|| Err(self.cleared()));
            }
        }
    }

    /// Fetch `keys` in sequential chunks of at most `max_batch_size`
    async fn dispatch(self: Arc<Self>, keys: Vec<K>) {
        for chunk in keys.chunks(self.config.max_batch_size.max(1)) {
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.total_keys.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            tracing::debug!(service = %self.service, keys = chunk.len(), "Dispatching batch");

            let fetched = AssertUnwindSafe(async { (self.fetch)(chunk.to_vec()).await })
                .catch_unwind()
                .await;
            let results = match fetched {
                Ok(Ok(values)) if values.len() == chunk.len() => Ok(values),
                Ok(Ok(values)) => Err(LoaderError::LengthMismatch {
                    service: self.service.clone(),
                    expected: chunk.len(),
                    actual: values.len(),
                }),
                Ok(Err(err)) => Err(LoaderError::from_fetch(&self.service, err)),
                Err(_) => Err(LoaderError::BatchFailed {
                    service: self.service.clone(),
                    message: "fetch function panicked".to_string(),
                }),
            };

            if let Err(err) = &results {
                tracing::warn!(
                    service = %self.service,
                    keys = chunk.len(),
                    error = %err,
                    "Batch load failed"
                );
            }
            self.deliver(chunk, results);
        }
    }

    fn deliver(&self, keys: &[K], results: Result<Vec<V>, LoaderError>) {
        let senders: Vec<_> = {
            let mut state = self.state.lock();
            keys.iter().map(|key| state.waiters.remove(key)).collect()
        };

        match results {
            Ok(values) => {
                for (tx, value) in senders.into_iter().zip(values) {
                    if let Some(tx) = tx {
                        let _ = tx.send(Some(Ok(value)));
                    }
                }
            }
            Err(err) => {
                for tx in senders.into_iter().flatten() {
                    let _ = tx.send(Some(Err(err.clone())));
                }
            }
        }
    }

    /// Abort pending work and fail every waiter with [`LoaderError::Cleared`]
    fn shutdown(&self) {
        let (tasks, waiters) = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.clear();
            state.generation += 1;
            (
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.waiters),
            )
        };
        for task in tasks {
            task.abort();
        }
        for tx in waiters.into_values() {
            let _ = tx.send(Some(Err(self.cleared())));
        }
    }

    fn cleared(&self) -> LoaderError {
        LoaderError::Cleared {
            service: self.service.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for BatchLoader<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("service", &self.service)
            .field("config", &self.config)
            .field("loads", &self.loads.load(Ordering::Relaxed))
            .finish()
    }
}

/// Registry view of a loader regardless of its key and value types
trait ErasedLoader: Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn service(&self) -> &str;
    fn counters(&self) -> LoaderCounters;
    fn shutdown(&self);
}

impl<K, V> ErasedLoader for BatchLoader<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn service(&self) -> &str {
        &self.service
    }

    fn counters(&self) -> LoaderCounters {
        BatchLoader::counters(self)
    }

    fn shutdown(&self) {
        BatchLoader::shutdown(self)
    }
}

/// A loader is identified by its owner scope, its service and the concrete
/// type of its fetch function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoaderId {
    scope: Option<Uuid>,
    service: String,
    fetch: TypeId,
    shape: TypeId,
}

/// Owns every batching loader, one per (service, fetch function)
pub struct LoaderRegistry {
    config: DataLoaderConfig,
    // SECURITY: Non-poisoning lock
    loaders: RwLock<AHashMap<LoaderId, Arc<dyn ErasedLoader>>>,
}

impl LoaderRegistry {
    pub fn new(config: DataLoaderConfig) -> Self {
        Self {
            config,
            loaders: RwLock::new(AHashMap::new()),
        }
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Get the loader for `service` and `fetch`, creating it on first use.
    ///
    /// The same fn item or closure definition always maps to the same loader
    /// for a given service; `fetch` is only kept when a loader is created.
    pub fn get_loader<K, V, F, Fut>(&self, service: &str, fetch: F) -> Arc<BatchLoader<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'static,
    {
        self.get_or_create(None, service, fetch)
    }

    /// Like [`Self::get_loader`], but keeps loaders of different `scope`s apart.
    ///
    /// Owners that share a registry while capturing their own state in the
    /// same closure definition pass a scope unique to themselves.
    pub fn get_scoped_loader<K, V, F, Fut>(
        &self,
        scope: Uuid,
        service: &str,
        fetch: F,
    ) -> Arc<BatchLoader<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'static,
    {
        self.get_or_create(Some(scope), service, fetch)
    }

    fn get_or_create<K, V, F, Fut>(
        &self,
        scope: Option<Uuid>,
        service: &str,
        fetch: F,
    ) -> Arc<BatchLoader<K, V>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'static,
    {
        let id = LoaderId {
            scope,
            service: service.to_string(),
            fetch: TypeId::of::<F>(),
            shape: TypeId::of::<(K, V)>(),
        };

        if let Some(existing) = self.lookup::<K, V>(&id) {
            return existing;
        }

        let mut loaders = self.loaders.write();
        if let Some(existing) = loaders
            .get(&id)
            .and_then(|erased| erased.clone().into_any().downcast::<BatchLoader<K, V>>().ok())
        {
            return existing;
        }

        tracing::debug!(service = %service, "Creating batch loader");
        let loader = BatchLoader::new(service, self.config.clone(), fetch);
        loaders.insert(id, loader.clone());
        loader
    }

    /// Aggregated statistics per service
    pub fn stats(&self) -> HashMap<String, LoaderStats> {
        let mut per_service: HashMap<String, LoaderCounters> = HashMap::new();
        for loader in self.loaders.read().values() {
            let entry = per_service.entry(loader.service().to_string()).or_default();
            *entry = *entry + loader.counters();
        }
        per_service
            .into_iter()
            .map(|(service, counters)| {
                let stats = LoaderStats::from_counters(&service, counters);
                (service, stats)
            })
            .collect()
    }

    /// Number of live loaders
    pub fn len(&self) -> usize {
        self.loaders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.read().is_empty()
    }

    /// Drop every loader. Pending and in-flight loads fail with [`LoaderError::Cleared`].
    pub fn clear_all(&self) {
        let drained: Vec<_> = self.loaders.write().drain().map(|(_, l)| l).collect();
        tracing::info!(loaders = drained.len(), "Clearing batch loaders");
        for loader in drained {
            loader.shutdown();
        }
    }

    fn lookup<K, V>(&self, id: &LoaderId) -> Option<Arc<BatchLoader<K, V>>>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let erased = self.loaders.read().get(id)?.clone();
        erased.into_any().downcast::<BatchLoader<K, V>>().ok()
    }
}

impl std::fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderRegistry")
            .field("config", &self.config)
            .field("loaders", &self.len())
            .finish()
    }
}

/// Shared loader registry
pub type SharedLoaderRegistry = Arc<LoaderRegistry>;

/// Create a new shared loader registry
pub fn create_loader_registry(config: DataLoaderConfig) -> SharedLoaderRegistry {
    Arc::new(LoaderRegistry::new(config))
}

/// Loader key for an entity representation.
///
/// Two representations of the same type are the same key regardless of the
/// order of their (nested) fields.
#[derive(Clone, Debug)]
pub struct EntityKey {
    typename: Arc<str>,
    normalized: NormalizedValue,
    representation: Arc<Value>,
}

impl EntityKey {
    pub fn new(typename: &str, representation: Value) -> Self {
        Self {
            typename: Arc::from(typename),
            normalized: NormalizedValue::from(&representation),
            representation: Arc::new(representation),
        }
    }

    pub fn typename(&self) -> &str {
        &self.typename
    }

    pub fn representation(&self) -> &Value {
        &self.representation
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.typename == other.typename && self.normalized == other.normalized
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.typename.hash(state);
        self.normalized.hash(state);
    }
}

/// Normalized representation of a JSON value for hashing.
/// Objects are sorted by key so nested field order does not affect identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum NormalizedValue {
    Null,
    Boolean(bool),
    Number(String),
    String(String),
    List(Vec<NormalizedValue>),
    Object(Vec<(String, NormalizedValue)>),
}

impl From<&Value> for NormalizedValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean(*b),
            Value::Number(n) => Self::Number(n.to_string()),
            Value::String(s) => Self::String(s.clone()),
            Value::Array(items) => Self::List(items.iter().map(Self::from).collect()),
            Value::Object(obj) => {
                let mut entries: Vec<(String, NormalizedValue)> = obj
                    .iter()
                    .map(|(key, value)| (key.clone(), NormalizedValue::from(value)))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Self::Object(entries)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    type Calls<K> = Arc<parking_lot::Mutex<Vec<Vec<K>>>>;

    fn recording_loader(
        max_batch_size: usize,
        window: Duration,
    ) -> (Arc<BatchLoader<&'static str, String>>, Calls<&'static str>) {
        let calls: Calls<&'static str> = Arc::default();
        let sink = calls.clone();
        let loader = BatchLoader::new(
            "products",
            DataLoaderConfig {
                max_batch_size,
                batch_window: window,
            },
            move |keys: Vec<&'static str>| {
                sink.lock().push(keys.clone());
                async move { Ok::<_, anyhow::Error>(keys.iter().map(|k| k.to_uppercase()).collect()) }
            },
        );
        (loader, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesces_duplicate_keys_in_first_seen_order() {
        let (loader, calls) = recording_loader(100, Duration::from_millis(10));

        let results = join_all(["b", "a", "b", "c", "a"].map(|k| loader.load(k))).await;
        let values: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(values, vec!["B", "A", "B", "C", "A"]);
        assert_eq!(calls.lock().as_slice(), &[vec!["b", "a", "c"]]);

        let stats = loader.stats();
        assert_eq!(stats.loads, 5);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.total_keys, 3);
        assert_eq!(stats.dedup_hits, 2);
        assert!((stats.avg_batch_size - 3.0).abs() < f64::EPSILON);
        assert!((stats.cache_hit_rate - 0.4).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_dispatches_without_waiting_for_window() {
        let (loader, calls) = recording_loader(2, Duration::from_secs(3600));
        let started = tokio::time::Instant::now();

        let (a, b) = tokio::join!(loader.load("x"), loader.load("y"));
        assert_eq!(a.unwrap(), "X");
        assert_eq!(b.unwrap(), "Y");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.lock().as_slice(), &[vec!["x", "y"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_flushes_partial_batch() {
        let (loader, calls) = recording_loader(10, Duration::from_millis(25));
        let started = tokio::time::Instant::now();

        assert_eq!(loader.load("solo").await.unwrap(), "SOLO");
        assert!(started.elapsed() >= Duration::from_millis(25));
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_load_many_splits_in_order() {
        let (loader, calls) = recording_loader(2, Duration::from_millis(10));

        let values = loader.load_many(vec!["a", "b", "c", "d", "e"]).await.unwrap();
        assert_eq!(values, vec!["A", "B", "C", "D", "E"]);
        assert_eq!(
            calls.lock().as_slice(),
            &[vec!["a", "b"], vec!["c", "d"], vec!["e"]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_reaches_every_waiter() {
        let loader = BatchLoader::new(
            "inventory",
            DataLoaderConfig::default(),
            |_keys: Vec<u32>| async { Err::<Vec<u32>, _>(anyhow::anyhow!("connection refused")) },
        );

        let (a, b) = tokio::join!(loader.load(1), loader.load(2));
        for result in [a, b] {
            match result {
                Err(LoaderError::BatchFailed { service, message }) => {
                    assert_eq!(service, "inventory");
                    assert!(message.contains("connection refused"));
                }
                other => panic!("expected batch failure, got {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_length_mismatch_is_batch_failure() {
        let loader = BatchLoader::new("reviews", DataLoaderConfig::default(), |_keys: Vec<u32>| async {
            Ok::<_, anyhow::Error>(vec![1u32])
        });

        let (a, _) = tokio::join!(loader.load(1), loader.load(2));
        assert!(matches!(
            a,
            Err(LoaderError::LengthMismatch { expected: 2, actual: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_recognized() {
        let loader = BatchLoader::new("accounts", DataLoaderConfig::default(), |_keys: Vec<u32>| async {
            Err::<Vec<u32>, _>(anyhow::Error::new(CircuitBreakerError::CircuitOpen {
                service: "accounts".to_string(),
                retry_after: None,
            }))
        });

        let err = loader.load(1).await.unwrap_err();
        assert!(matches!(err, LoaderError::CircuitOpen(_)));
        assert_eq!(err.service(), "accounts");
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_fetch_fails_waiters() {
        let loader = BatchLoader::new("flaky", DataLoaderConfig::default(), |_keys: Vec<u32>| async {
            if true {
                panic!("fetch bug");
            }
            Ok::<Vec<u32>, anyhow::Error>(Vec::new())
        });

        let err = loader.load(1).await.unwrap_err();
        assert!(matches!(err, LoaderError::BatchFailed { .. }));
    }

    async fn double(keys: Vec<u32>) -> anyhow::Result<Vec<u32>> {
        Ok(keys.into_iter().map(|k| k * 2).collect())
    }

    async fn triple(keys: Vec<u32>) -> anyhow::Result<Vec<u32>> {
        Ok(keys.into_iter().map(|k| k * 3).collect())
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_identity() {
        let registry = LoaderRegistry::new(DataLoaderConfig::default());

        let a = registry.get_loader("svc", double);
        let b = registry.get_loader("svc", double);
        let c = registry.get_loader("other", double);
        let d = registry.get_loader("svc", triple);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!Arc::ptr_eq(&a, &d));
        assert_eq!(registry.len(), 3);

        assert_eq!(a.load(4).await.unwrap(), 8);
        assert_eq!(d.load(4).await.unwrap(), 12);
    }

    fn scaled(
        factor: u32,
    ) -> impl Fn(Vec<u32>) -> futures::future::Ready<anyhow::Result<Vec<u32>>> + Send + Sync + 'static
    {
        move |keys| futures::future::ready(Ok(keys.into_iter().map(|k| k * factor).collect()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_loaders_keep_owners_apart() {
        let registry = LoaderRegistry::new(DataLoaderConfig::default());

        // Same closure definition, different captures: unscoped lookups share
        let first = registry.get_loader("svc", scaled(2));
        let second = registry.get_loader("svc", scaled(5));
        assert!(Arc::ptr_eq(&first, &second));

        let (owner_a, owner_b) = (Uuid::new_v4(), Uuid::new_v4());
        let a = registry.get_scoped_loader(owner_a, "svc", scaled(2));
        let b = registry.get_scoped_loader(owner_b, "svc", scaled(5));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &registry.get_scoped_loader(owner_a, "svc", scaled(7))));
        assert_eq!(registry.len(), 3);

        assert_eq!(a.service(), "svc");
        assert_eq!(b.service(), "svc");
        assert_eq!(a.load(3).await.unwrap(), 6);
        assert_eq!(b.load(3).await.unwrap(), 15);

        // Scopes still aggregate under their service
        assert_eq!(registry.stats()["svc"].loads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_stats_aggregate_per_service() {
        let registry = LoaderRegistry::new(DataLoaderConfig::default());
        let doubles = registry.get_loader("svc", double);
        let triples = registry.get_loader("svc", triple);

        let _ = tokio::join!(doubles.load(1), doubles.load(1), triples.load(2));

        let stats = registry.stats();
        let svc = stats.get("svc").unwrap();
        assert_eq!(svc.loads, 3);
        assert_eq!(svc.batches, 2);
        assert_eq!(svc.dedup_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_fails_pending_loads() {
        let registry = LoaderRegistry::new(DataLoaderConfig {
            max_batch_size: 10,
            batch_window: Duration::from_secs(60),
        });
        let fetched = Arc::new(AtomicUsize::new(0));
        let counter = fetched.clone();
        let loader = registry.get_loader("svc", move |keys: Vec<u32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, anyhow::Error>(keys) }
        });

        let waiting = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load(7).await }
        });
        tokio::task::yield_now().await;

        registry.clear_all();
        assert!(registry.is_empty());

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(LoaderError::Cleared { .. })));
        assert_eq!(fetched.load(Ordering::SeqCst), 0);

        // The detached handle refuses new work
        assert!(matches!(loader.load(8).await, Err(LoaderError::Cleared { .. })));
    }

    #[test]
    fn test_entity_key_ignores_field_order() {
        let a = EntityKey::new("User", json!({"id": "1", "org": {"id": 2, "region": "eu"}}));
        let b = EntityKey::new("User", json!({"org": {"region": "eu", "id": 2}, "id": "1"}));
        let c = EntityKey::new("Account", json!({"id": "1", "org": {"id": 2, "region": "eu"}}));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_eq!(b.typename(), "User");
        assert_eq!(b.representation()["id"], "1");
    }
}
