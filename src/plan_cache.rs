//! Query plan cache
//!
//! Planning a federated query is expensive and its output depends only on the
//! query text and variables. The plan cache stores compiled [`QueryPlan`]s
//! keyed by a hash of those inputs so structurally identical queries skip the
//! planner entirely.
//!
//! ## Keys
//!
//! [`PlanCache::generate_key`] hashes (SHA-256, hex encoded):
//! - the whitespace-normalized query
//! - the variables, with object keys sorted recursively
//! - the operation name, when present
//!
//! Reordering variable keys never changes the key.
//!
//! ## Eviction
//!
//! The cache never holds more than `max_size` entries. When a new key would
//! overflow it, entries are evicted by [`EvictionStrategy`] priority
//! (oldest access for LRU, fewest hits for LFU, oldest insertion for FIFO),
//! breaking ties by insertion order. [`EvictionMode::Batch`] evicts a larger
//! chunk at once to amortize the scan.
//!
//! ## Example
//!
//! ```rust
//! use federation_accelerator::{PlanCache, PlanCacheConfig, QueryPlan};
//!
//! let cache = PlanCache::new(PlanCacheConfig::default());
//! let key = PlanCache::generate_key("{ me { id } }", None, None);
//!
//! assert!(cache.get(&key).is_none());
//! cache.set(key.clone(), QueryPlan::default());
//! assert!(cache.get(&key).is_some());
//! assert_eq!(cache.stats().hits, 1);
//! ```

use crate::plan::QueryPlan;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Which entry gives way first when the cache is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
    /// First in, first out
    Fifo,
}

/// How many entries are evicted when room is needed
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum EvictionMode {
    /// Evict just enough entries to make room
    #[default]
    Single,
    /// Evict `max(ceil(len * fraction), batch_size, 1)` entries at once
    Batch {
        fraction: f64,
        #[serde(rename = "batchSize")]
        batch_size: usize,
    },
}

/// Plan cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanCacheConfig {
    /// Maximum number of cached plans. Zero disables caching.
    pub max_size: usize,
    /// Plans older than this are dropped on access
    #[serde(with = "crate::config::option_duration_ms")]
    pub ttl: Option<Duration>,
    pub strategy: EvictionStrategy,
    pub eviction: EvictionMode,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Some(Duration::from_secs(300)),
            strategy: EvictionStrategy::Lru,
            eviction: EvictionMode::Single,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
}

/// A cached plan with its bookkeeping
#[derive(Debug, Clone)]
struct CachedPlanEntry {
    plan: Arc<QueryPlan>,
    /// Normalized source query, when known; matched by `invalidate`
    query: Option<String>,
    created_at: Instant,
    access_count: u64,
    /// Insertion order, used for FIFO and to break ties
    sequence: u64,
    /// Logical clock of the last insert or hit; orders LRU
    last_touch: u64,
}

impl CachedPlanEntry {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.created_at.elapsed() > ttl)
    }

    fn priority(&self, strategy: EvictionStrategy) -> (u64, u64) {
        let primary = match strategy {
            EvictionStrategy::Lru => self.last_touch,
            EvictionStrategy::Lfu => self.access_count,
            EvictionStrategy::Fifo => self.sequence,
        };
        (primary, self.sequence)
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedPlanEntry>,
    next_sequence: u64,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Bounded in-memory cache of query plans
pub struct PlanCache {
    config: PlanCacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl PlanCache {
    /// Create a new plan cache with the given configuration
    pub fn new(config: PlanCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PlanCacheConfig {
        &self.config
    }

    /// Generate a cache key from query components
    pub fn generate_key(
        query: &str,
        variables: Option<&serde_json::Value>,
        operation_name: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_query(query).as_bytes());

        if let Some(vars) = variables.filter(|v| !v.is_null()) {
            if let Ok(vars_str) = serde_json::to_string(&sort_json_value(vars)) {
                hasher.update([0u8]);
                hasher.update(vars_str.as_bytes());
            }
        }

        if let Some(op_name) = operation_name {
            hasher.update([0u8]);
            hasher.update(op_name.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Look up a plan, counting a hit or a miss
    pub fn get(&self, key: &str) -> Option<Arc<QueryPlan>> {
        let plan = {
            let mut state = self.lock();
            let ttl = self.config.ttl;
            let expired = state.entries.get(key).is_some_and(|e| e.is_expired(ttl));
            if expired {
                state.entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = %key, "Plan cache entry expired");
            }
            let touch = state.tick();
            state.entries.get_mut(key).map(|entry| {
                entry.access_count += 1;
                entry.last_touch = touch;
                entry.plan.clone()
            })
        };

        match plan {
            Some(plan) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = %key, "Plan cache hit");
                Some(plan)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache_key = %key, "Plan cache miss");
                None
            }
        }
    }

    /// Store a plan under `key`, replacing any previous entry
    pub fn set(&self, key: impl Into<String>, plan: impl Into<Arc<QueryPlan>>) {
        self.insert(key.into(), None, plan.into());
    }

    /// Store a plan and remember its source query for pattern invalidation
    pub fn set_for_query(&self, key: impl Into<String>, query: &str, plan: impl Into<Arc<QueryPlan>>) {
        self.insert(key.into(), Some(normalize_query(query)), plan.into());
    }

    /// Remove entries whose key or source query matches `pattern`.
    ///
    /// `None` clears the whole cache. A pattern that is not a valid regular
    /// expression is matched literally. Returns the number of removed entries.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut state = self.lock();

        let removed = match pattern {
            None => {
                let count = state.entries.len();
                state.entries.clear();
                count
            }
            Some(pattern) => {
                let regex = match Regex::new(pattern) {
                    Ok(regex) => regex,
                    Err(_) => match Regex::new(&regex::escape(pattern)) {
                        Ok(regex) => regex,
                        Err(_) => return 0,
                    },
                };
                let before = state.entries.len();
                state.entries.retain(|key, entry| {
                    !(regex.is_match(key)
                        || entry.query.as_deref().is_some_and(|q| regex.is_match(q)))
                });
                before - state.entries.len()
            }
        };

        tracing::debug!(pattern = ?pattern, removed = removed, "Plan cache invalidated");
        removed
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Whether `key` is cached and not expired. Does not count as an access.
    pub fn contains(&self, key: &str) -> bool {
        self.lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(self.config.ttl))
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut state = self.lock();
        self.purge_expired_locked(&mut state)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let (hit_rate, miss_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (hits as f64 / total as f64, misses as f64 / total as f64)
        };

        CacheStats {
            size: self.len(),
            max_size: self.config.max_size,
            hits,
            misses,
            hit_rate,
            miss_rate,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    fn insert(&self, key: String, query: Option<String>, plan: Arc<QueryPlan>) {
        if self.config.max_size == 0 {
            return;
        }
        let mut state = self.lock();

        // Overwrite counts as a fresh insertion
        state.entries.remove(&key);

        if state.entries.len() >= self.config.max_size {
            self.purge_expired_locked(&mut state);
        }
        if state.entries.len() >= self.config.max_size {
            let needed = state.entries.len() + 1 - self.config.max_size;
            self.evict_locked(&mut state, needed);
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let touch = state.tick();
        state.entries.insert(
            key,
            CachedPlanEntry {
                plan,
                query,
                created_at: Instant::now(),
                access_count: 0,
                sequence,
                last_touch: touch,
            },
        );
    }

    fn evict_locked(&self, state: &mut CacheState, needed: usize) {
        let len = state.entries.len();
        let count = match self.config.eviction {
            EvictionMode::Single => needed,
            EvictionMode::Batch {
                fraction,
                batch_size,
            } => {
                let by_fraction = (len as f64 * fraction).ceil() as usize;
                needed.max(by_fraction).max(batch_size).max(1)
            }
        }
        .min(len);

        let strategy = self.config.strategy;
        let mut candidates: Vec<((u64, u64), &String)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.priority(strategy), key))
            .collect();
        candidates.sort_unstable_by_key(|(priority, _)| *priority);
        let victims: Vec<String> = candidates
            .into_iter()
            .take(count)
            .map(|(_, key)| key.clone())
            .collect();

        for key in &victims {
            state.entries.remove(key);
        }
        self.evictions.fetch_add(victims.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            evicted = victims.len(),
            strategy = ?strategy,
            "Plan cache evicted entries"
        );
    }

    fn purge_expired_locked(&self, state: &mut CacheState) -> usize {
        let ttl = self.config.ttl;
        if ttl.is_none() {
            return 0;
        }
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(ttl));
        let purged = before - state.entries.len();
        self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// A poisoned lock means a panic mid-update. The entries may be half
    /// written, so they are dropped and the cache starts over empty.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                let dropped = state.entries.len();
                *state = CacheState::default();
                self.state.clear_poison();
                tracing::warn!(dropped = dropped, "Plan cache lock was poisoned, cache cleared");
                state
            }
        }
    }
}

impl std::fmt::Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCache")
            .field("config", &self.config)
            .field("size", &self.len())
            .finish()
    }
}

/// Shared plan cache
pub type SharedPlanCache = Arc<PlanCache>;

/// Create a new shared plan cache
pub fn create_plan_cache(config: PlanCacheConfig) -> SharedPlanCache {
    Arc::new(PlanCache::new(config))
}

/// Collapse runs of whitespace so formatting never affects the key
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sort JSON object keys recursively for consistent hashing
fn sort_json_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by_key(|(k, _)| *k);
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_json_value(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_value).collect())
        }
        _ => value.clone(),
    }
}
