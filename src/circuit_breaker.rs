//! Circuit Breaker pattern for subgraph resilience
//!
//! The Circuit Breaker prevents cascading failures by "breaking" the circuit when a
//! subgraph is unhealthy. This stops sending requests to failing services,
//! giving them time to recover.
//!
//! ## States
//!
//! - **Closed**: Normal operation, calls flow through
//! - **Open**: Service unhealthy, calls are rejected without being attempted
//! - **Half-Open**: Testing recovery, a limited number of trial calls allowed through
//!
//! ## How It Works
//!
//! 1. Circuit starts **Closed** - all calls go through
//! 2. After `failure_threshold` consecutive failures → Circuit **Opens**
//! 3. The first call attempted after `timeout` moves the circuit to **Half-Open**
//! 4. After `success_threshold` consecutive trial successes → Circuit **Closes**
//! 5. Any trial failure → Circuit **Opens** again
//!
//! ## Example
//!
//! ```rust,no_run
//! use federation_accelerator::{CircuitBreakerRegistry, CircuitBreakerConfig};
//!
//! # async fn example() {
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
//! let breaker = registry.get_or_create("products");
//!
//! let result = breaker
//!     .execute(|| async { Ok::<_, std::io::Error>("fetched") })
//!     .await;
//! assert!(result.is_ok());
//! # }
//! ```

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - calls flow through
    Closed,
    /// Service unhealthy - calls are rejected
    Open,
    /// Testing recovery - limited trial calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the Circuit Breaker
///
/// # Example
///
/// ```rust
/// use federation_accelerator::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig {
///     failure_threshold: 5,              // Open after 5 consecutive failures
///     success_threshold: 3,              // Close after 3 trial successes
///     timeout: Duration::from_secs(60),  // Stay open for a minute
///     half_open_max_calls: 3,            // At most 3 trial calls in flight
/// };
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes needed to close the circuit
    pub success_threshold: u32,
    /// Time the circuit stays open before a trial call is permitted
    #[serde(rename = "timeoutMs", with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Maximum trial calls in flight while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Apply per-service overrides on top of this configuration
    pub fn merged(&self, overrides: &CircuitBreakerOverrides) -> Self {
        Self {
            failure_threshold: overrides.failure_threshold.unwrap_or(self.failure_threshold),
            success_threshold: overrides.success_threshold.unwrap_or(self.success_threshold),
            timeout: overrides.timeout.unwrap_or(self.timeout),
            half_open_max_calls: overrides
                .half_open_max_calls
                .unwrap_or(self.half_open_max_calls),
        }
    }
}

/// Partial configuration merged over the registry defaults when a breaker is created
#[derive(Clone, Debug, Default)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub timeout: Option<Duration>,
    pub half_open_max_calls: Option<u32>,
}

/// Callback invoked with `(service, old_state, new_state)` on every transition
pub type StateChangeListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Point-in-time view of a single breaker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerMetrics {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    /// Unix epoch millis
    pub last_failure_at: Option<u64>,
    /// Unix epoch millis
    pub last_success_at: Option<u64>,
    /// Unix epoch millis
    pub last_state_change_at: u64,
    pub time_in_state_ms: u64,
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every transition; outcomes of calls admitted under an
    /// older epoch no longer count
    epoch: u64,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    last_failure_at: Option<u64>,
    last_success_at: Option<u64>,
    state_changed_at: Instant,
    state_changed_wall: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            epoch: 0,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            last_failure_at: None,
            last_success_at: None,
            state_changed_at: Instant::now(),
            state_changed_wall: epoch_millis(),
        }
    }

    /// Move to `next`, resetting the per-state counters.
    fn transition(&mut self, next: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let previous = self.state;
        self.state = next;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.epoch += 1;
        self.state_changed_at = Instant::now();
        self.state_changed_wall = epoch_millis();
        (previous != next).then_some((previous, next))
    }
}

/// Circuit breaker for a single service
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    service_name: String,
    listener: Option<StateChangeListener>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for a service
    pub fn new(service_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::new()),
            service_name: service_name.into(),
            listener: None,
        }
    }

    /// Attach a state-change listener
    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Get current circuit state
    ///
    /// An open circuit whose timeout has elapsed still reports `Open` until
    /// the next call attempt moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get the service name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Get the configuration this breaker was created with
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under the breaker.
    ///
    /// Returns [`CallError::Rejected`] without invoking `operation` when the
    /// circuit is open, [`CallError::Failed`] when the operation itself fails.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = self.acquire()?;
        match operation().await {
            Ok(value) => {
                self.record_success(&mut permit);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&mut permit);
                Err(CallError::Failed(err))
            }
        }
    }

    /// Run `operation`, re-attempting up to `max_retries` more times with a fixed
    /// `delay` between attempts. Every attempt goes through [`Self::execute`].
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut operation: F,
        max_retries: u32,
        delay: Duration,
    ) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt > max_retries => return Err(err),
                Err(_) => {
                    tracing::debug!(
                        service = %self.service_name,
                        attempt = attempt,
                        max_retries = max_retries,
                        "Call failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run `primary` under the breaker; if it is rejected or fails, run `fallback`.
    ///
    /// The fallback is not subject to the breaker. When both fail the error
    /// names both causes.
    pub async fn execute_with_fallback<P, PFut, B, BFut, T, E>(
        &self,
        primary: P,
        fallback: B,
    ) -> Result<T, CallError<E>>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, E>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let primary_err = match self.execute(primary).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        tracing::debug!(
            service = %self.service_name,
            error = %primary_err,
            "Primary call failed, invoking fallback"
        );

        fallback()
            .await
            .map_err(|fallback_err| CallError::FallbackFailed {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            })
    }

    /// Snapshot of counters and timestamps
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock();
        CircuitBreakerMetrics {
            service: self.service_name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
            last_state_change_at: state.state_changed_wall,
            time_in_state_ms: state.state_changed_at.elapsed().as_millis() as u64,
        }
    }

    /// Force reset the circuit breaker to closed state and zero every counter
    pub fn reset(&self) {
        let change = {
            let mut state = self.state.lock();
            let previous = state.state;
            let epoch = state.epoch + 1;
            *state = BreakerState::new();
            state.epoch = epoch;
            (previous != CircuitState::Closed).then_some((previous, CircuitState::Closed))
        };
        tracing::info!(service = %self.service_name, "Circuit breaker manually RESET");
        self.notify(change);
    }

    /// Administratively open the circuit
    pub fn force_open(&self) {
        let change = self.state.lock().transition(CircuitState::Open);
        tracing::warn!(service = %self.service_name, "Circuit breaker FORCED OPEN");
        self.notify(change);
    }

    /// Administratively close the circuit, keeping call totals
    pub fn force_close(&self) {
        let change = self.state.lock().transition(CircuitState::Closed);
        tracing::info!(service = %self.service_name, "Circuit breaker FORCED CLOSED");
        self.notify(change);
    }

    /// Check whether a call may proceed, moving an expired open circuit to half-open.
    fn acquire(&self) -> Result<CallPermit<'_>, CircuitBreakerError> {
        let mut change = None;
        let decision = {
            let mut state = self.state.lock();
            state.total_calls += 1;

            if state.state == CircuitState::Open
                && state.state_changed_at.elapsed() >= self.config.timeout
            {
                change = state.transition(CircuitState::HalfOpen);
                tracing::info!(
                    service = %self.service_name,
                    "Circuit breaker HALF-OPEN - testing recovery"
                );
            }

            match state.state {
                CircuitState::Closed => Ok((false, state.epoch)),
                CircuitState::Open => {
                    state.rejected_calls += 1;
                    let retry_after = self
                        .config
                        .timeout
                        .checked_sub(state.state_changed_at.elapsed());
                    tracing::debug!(
                        service = %self.service_name,
                        "Circuit breaker OPEN - rejecting call"
                    );
                    Err(CircuitBreakerError::CircuitOpen {
                        service: self.service_name.clone(),
                        retry_after,
                    })
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight < self.config.half_open_max_calls {
                        state.half_open_in_flight += 1;
                        tracing::debug!(
                            service = %self.service_name,
                            in_flight = state.half_open_in_flight,
                            max = self.config.half_open_max_calls,
                            "Circuit breaker HALF-OPEN - allowing trial call"
                        );
                        Ok((true, state.epoch))
                    } else {
                        state.rejected_calls += 1;
                        Err(CircuitBreakerError::CircuitOpen {
                            service: self.service_name.clone(),
                            retry_after: None,
                        })
                    }
                }
            }
        };
        self.notify(change);

        decision.map(|(trial, epoch)| CallPermit {
            breaker: self,
            trial,
            epoch,
            completed: false,
        })
    }

    fn record_success(&self, permit: &mut CallPermit<'_>) {
        permit.completed = true;
        let change = {
            let mut state = self.state.lock();
            state.successful_calls += 1;
            state.last_success_at = Some(epoch_millis());
            if permit.epoch != state.epoch {
                tracing::debug!(service = %self.service_name, "Ignoring outcome of a call from a previous state");
                return;
            }
            match state.state {
                CircuitState::Closed => {
                    state.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if permit.trial => {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        tracing::info!(
                            service = %self.service_name,
                            "Circuit breaker CLOSED - service recovered"
                        );
                        state.transition(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    fn record_failure(&self, permit: &mut CallPermit<'_>) {
        permit.completed = true;
        let change = {
            let mut state = self.state.lock();
            state.failed_calls += 1;
            state.last_failure_at = Some(epoch_millis());
            if permit.epoch != state.epoch {
                tracing::debug!(service = %self.service_name, "Ignoring outcome of a call from a previous state");
                return;
            }
            match state.state {
                CircuitState::Closed => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        tracing::warn!(
                            service = %self.service_name,
                            failures = state.consecutive_failures,
                            "Circuit breaker OPENED - too many failures"
                        );
                        state.transition(CircuitState::Open)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if permit.trial => {
                    tracing::warn!(
                        service = %self.service_name,
                        "Circuit breaker REOPENED - trial call failed"
                    );
                    state.transition(CircuitState::Open)
                }
                CircuitState::HalfOpen | CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    /// Give back a half-open slot whose call never reported an outcome.
    fn release_trial(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch && state.state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    fn notify(&self, change: Option<(CircuitState, CircuitState)>) {
        let (Some((from, to)), Some(listener)) = (change, self.listener.as_ref()) else {
            return;
        };
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| listener(&self.service_name, from, to)));
        if outcome.is_err() {
            tracing::warn!(
                service = %self.service_name,
                "Circuit breaker state listener panicked; ignoring"
            );
        }
    }
}

/// Admission ticket for one call, tied to the epoch it was admitted in.
/// Returns an unfinished half-open slot on drop.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    epoch: u64,
    completed: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.completed {
            self.breaker.release_trial(self.epoch);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service_name)
            .field("state", &state.state)
            .field("consecutive_failures", &state.consecutive_failures)
            .finish()
    }
}

/// Aggregated view across every managed breaker
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySummary {
    pub breakers: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub failed_calls: u64,
}

/// Registry of circuit breakers for all services
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    listener: Option<StateChangeListener>,
    breakers: RwLock<AHashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a new registry with the given default configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            listener: None,
            breakers: RwLock::new(AHashMap::new()),
        }
    }

    /// Attach a listener to every breaker this registry creates from now on
    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Get or create a circuit breaker for a service using the default configuration
    pub fn get_or_create(&self, service_name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(service_name, &CircuitBreakerOverrides::default())
    }

    /// Get or create a circuit breaker, merging `overrides` into the defaults.
    ///
    /// Overrides only apply when the breaker is created.
    pub fn get_or_create_with(
        &self,
        service_name: &str,
        overrides: &CircuitBreakerOverrides,
    ) -> Arc<CircuitBreaker> {
        // Fast path: check if exists
        if let Some(breaker) = self.breakers.read().get(service_name) {
            return breaker.clone();
        }

        // Slow path: create new breaker
        let mut breakers = self.breakers.write();
        breakers
            .entry(service_name.to_string())
            .or_insert_with(|| {
                let mut breaker =
                    CircuitBreaker::new(service_name, self.config.merged(overrides));
                if let Some(listener) = &self.listener {
                    breaker = breaker.with_listener(listener.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    /// Get a circuit breaker for a service (if exists)
    pub fn get(&self, service_name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(service_name).cloned()
    }

    /// Get all circuit breakers
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }

    /// Get status of all circuit breakers
    pub fn status(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.state()))
            .collect()
    }

    /// Metrics for every breaker, ordered by service name
    pub fn metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self.all().iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.service.cmp(&b.service));
        metrics
    }

    /// Totals across every breaker
    pub fn summary(&self) -> RegistrySummary {
        self.metrics()
            .into_iter()
            .fold(RegistrySummary::default(), |mut summary, m| {
                summary.breakers += 1;
                match m.state {
                    CircuitState::Closed => summary.closed += 1,
                    CircuitState::Open => summary.open += 1,
                    CircuitState::HalfOpen => summary.half_open += 1,
                }
                summary.total_calls += m.total_calls;
                summary.rejected_calls += m.rejected_calls;
                summary.failed_calls += m.failed_calls;
                summary
            })
    }

    /// Reset all circuit breakers
    pub fn reset_all(&self) {
        for breaker in self.all() {
            breaker.reset();
        }
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("services", &self.breakers.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared circuit breaker registry
pub type SharedCircuitBreakerRegistry = Arc<CircuitBreakerRegistry>;

/// Create a new shared circuit breaker registry
pub fn create_circuit_breaker_registry(
    config: CircuitBreakerConfig,
) -> SharedCircuitBreakerRegistry {
    Arc::new(CircuitBreakerRegistry::new(config))
}

/// Error types for circuit breaker
#[derive(Debug, Clone, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open - the call was not attempted
    #[error("Circuit breaker open for service '{service}'. Retry after {retry_after:?}")]
    CircuitOpen {
        service: String,
        retry_after: Option<Duration>,
    },
}

impl CircuitBreakerError {
    /// Convert to GraphQL error extensions
    pub fn to_extensions(&self) -> HashMap<String, serde_json::Value> {
        let mut extensions = HashMap::new();
        match self {
            CircuitBreakerError::CircuitOpen {
                service,
                retry_after,
            } => {
                extensions.insert("code".to_string(), serde_json::json!("SERVICE_UNAVAILABLE"));
                extensions.insert("service".to_string(), serde_json::json!(service));
                if let Some(retry) = retry_after {
                    extensions.insert("retryAfter".to_string(), serde_json::json!(retry.as_secs()));
                }
            }
        }
        extensions
    }
}

/// Outcome of a call routed through a breaker
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    /// Not attempted: the circuit is open
    #[error(transparent)]
    Rejected(#[from] CircuitBreakerError),
    /// Attempted and failed
    #[error("{0}")]
    Failed(E),
    /// Both the primary call and its fallback failed
    #[error("primary call failed ({primary}); fallback failed ({fallback})")]
    FallbackFailed { primary: String, fallback: String },
}

impl<E> CallError<E> {
    /// Whether the call was rejected without being attempted
    pub fn is_rejected(&self) -> bool {
        matches!(self, CallError::Rejected(_))
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(failure_threshold: u32, success_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        let _ = cb.execute(|| async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.execute(|| async { Ok::<_, &str>(7) }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_transition_cycle() {
        let cb = CircuitBreaker::new("test", config(3, 2));

        for _ in 0..3 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Rejected without invoking the operation
        let invoked = AtomicUsize::new(0);
        let result = cb
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CallError::Rejected(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        // Still reports open until a call is attempted
        assert_eq!(cb.state(), CircuitState::Open);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    fn pending_call(
        cb: &CircuitBreaker,
        rx: tokio::sync::oneshot::Receiver<bool>,
    ) -> std::pin::Pin<Box<impl Future<Output = Result<(), CallError<&'static str>>> + '_>> {
        Box::pin(cb.execute(move || async move {
            match rx.await {
                Ok(true) => Ok(()),
                _ => Err("failed"),
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_from_previous_state_are_ignored() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                timeout: Duration::from_secs(30),
                half_open_max_calls: 1,
            },
        );

        // Admitted while closed, finishes much later
        let (slow_tx, slow_rx) = tokio::sync::oneshot::channel();
        let mut slow = pending_call(&cb, slow_rx);
        assert!(futures::poll!(slow.as_mut()).is_pending());

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(31)).await;

        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel();
        let mut trial = pending_call(&cb, trial_rx);
        assert!(futures::poll!(trial.as_mut()).is_pending());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Not a trial call: neither closes the circuit nor frees the trial slot
        slow_tx.send(true).unwrap();
        assert!(slow.await.is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(
            cb.execute(|| async { Ok::<_, &str>(()) }).await,
            Err(CallError::Rejected(_))
        ));

        trial_tx.send(true).unwrap();
        assert!(trial.await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);

        // A failure admitted while closed does not reopen a recovering circuit
        let (late_tx, late_rx) = tokio::sync::oneshot::channel();
        let mut late = pending_call(&cb, late_rx);
        assert!(futures::poll!(late.as_mut()).is_pending());

        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        let (trial_tx, trial_rx) = tokio::sync::oneshot::channel();
        let mut trial = pending_call(&cb, trial_rx);
        assert!(futures::poll!(trial.as_mut()).is_pending());

        late_tx.send(false).unwrap();
        assert!(matches!(late.await, Err(CallError::Failed("failed"))));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().failed_calls, 3);

        trial_tx.send(true).unwrap();
        assert!(trial.await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_concurrent_trials() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 2,
                timeout: Duration::from_secs(30),
                half_open_max_calls: 2,
            },
        );
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let (first_tx, first_rx) = tokio::sync::oneshot::channel();
        let mut first = pending_call(&cb, first_rx);
        assert!(futures::poll!(first.as_mut()).is_pending());
        let (_second_tx, second_rx) = tokio::sync::oneshot::channel();
        let mut second = pending_call(&cb, second_rx);
        assert!(futures::poll!(second.as_mut()).is_pending());

        // Both slots taken
        let over_limit = cb.execute(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(
            over_limit,
            Err(CallError::Rejected(CircuitBreakerError::CircuitOpen { retry_after: None, .. }))
        ));

        // A cancelled trial gives its slot back
        drop(second);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().consecutive_successes, 1);

        first_tx.send(true).unwrap();
        assert!(first.await.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", config(3, 1));

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.metrics().consecutive_failures, 2);

        succeed(&cb).await;
        assert_eq!(cb.metrics().consecutive_failures, 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", config(1, 2));

        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.metrics().time_in_state_ms < 1_000);
    }

    #[tokio::test]
    async fn test_manual_controls() {
        let cb = CircuitBreaker::new("test", config(1, 1));

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().total_calls, 0);

        cb.force_open();
        assert_eq!(cb.state(), CircuitState::Open);
        fail(&cb).await;
        assert_eq!(cb.metrics().rejected_calls, 1);

        cb.force_close();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_metrics_track_calls() {
        let cb = CircuitBreaker::new("test", config(2, 1));

        succeed(&cb).await;
        fail(&cb).await;
        fail(&cb).await;
        fail(&cb).await;

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.total_calls, 4);
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 2);
        assert_eq!(metrics.rejected_calls, 1);
        assert!(metrics.last_failure_at.is_some());
        assert!(metrics.last_success_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let cb = CircuitBreaker::new("test", config(10, 1));
        let attempts = AtomicUsize::new(0);

        let result = cb
            .execute_with_retry(
                || async {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky")
                    } else {
                        Ok("done")
                    }
                },
                3,
                Duration::from_millis(100),
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let cb = CircuitBreaker::new("test", config(10, 1));
        let attempts = AtomicUsize::new(0);

        let result = cb
            .execute_with_retry(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("down")
                },
                2,
                Duration::from_millis(10),
            )
            .await;

        assert!(matches!(result, Err(CallError::Failed("down"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fallback_on_open_circuit() {
        let cb = CircuitBreaker::new("test", config(1, 1));
        cb.force_open();

        let result = cb
            .execute_with_fallback(
                || async { Ok::<_, String>("primary") },
                || async { Ok("fallback") },
            )
            .await;
        assert_eq!(result.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_fallback_combined_error() {
        let cb = CircuitBreaker::new("test", config(5, 1));

        let result = cb
            .execute_with_fallback(
                || async { Err::<(), _>("primary down".to_string()) },
                || async { Err("cache empty".to_string()) },
            )
            .await;

        match result {
            Err(CallError::FallbackFailed { primary, fallback }) => {
                assert!(primary.contains("primary down"));
                assert!(fallback.contains("cache empty"));
            }
            other => panic!("expected combined failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listener_observes_transitions_and_panics_are_contained() {
        let seen: Arc<parking_lot::Mutex<Vec<(String, CircuitState, CircuitState)>>> =
            Arc::default();
        let sink = seen.clone();
        let listener: StateChangeListener =
            Arc::new(move |service: &str, from: CircuitState, to: CircuitState| {
                sink.lock().push((service.to_string(), from, to));
                panic!("listener bug");
            });
        let cb = CircuitBreaker::new("orders", config(1, 1)).with_listener(listener);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            seen.lock().as_slice(),
            &[("orders".to_string(), CircuitState::Closed, CircuitState::Open)]
        );
    }

    #[tokio::test]
    async fn test_registry() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());

        let cb1 = registry.get_or_create("service1");
        let cb2 = registry.get_or_create("service2");
        let cb1_again = registry.get_or_create("service1");

        assert!(Arc::ptr_eq(&cb1, &cb1_again));
        assert!(!Arc::ptr_eq(&cb1, &cb2));
        assert_eq!(registry.all().len(), 2);
    }

    #[tokio::test]
    async fn test_registry_overrides_and_summary() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let overrides = CircuitBreakerOverrides {
            failure_threshold: Some(1),
            ..Default::default()
        };

        let fragile = registry.get_or_create_with("fragile", &overrides);
        let sturdy = registry.get_or_create("sturdy");
        assert_eq!(fragile.config().failure_threshold, 1);
        assert_eq!(sturdy.config().failure_threshold, 5);
        assert_eq!(sturdy.config().timeout, Duration::from_secs(60));

        fail(&fragile).await;
        fail(&sturdy).await;

        let status = registry.status();
        assert_eq!(status.get("fragile"), Some(&CircuitState::Open));
        assert_eq!(status.get("sturdy"), Some(&CircuitState::Closed));

        let summary = registry.summary();
        assert_eq!(summary.breakers, 2);
        assert_eq!(summary.open, 1);
        assert_eq!(summary.failed_calls, 2);

        registry.reset_all();
        assert_eq!(registry.summary().open, 0);
    }

    #[test]
    fn test_error_extensions() {
        let err = CircuitBreakerError::CircuitOpen {
            service: "test".to_string(),
            retry_after: Some(Duration::from_secs(30)),
        };

        let ext = err.to_extensions();
        assert_eq!(ext.get("code"), Some(&serde_json::json!("SERVICE_UNAVAILABLE")));
        assert_eq!(ext.get("service"), Some(&serde_json::json!("test")));
        assert_eq!(ext.get("retryAfter"), Some(&serde_json::json!(30)));
    }
}
