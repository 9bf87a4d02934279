//! Distributed circuit breaker for the inference service.
//!
//! Three states:
//! - CLOSED: normal operation, failures are tracked.
//! - OPEN: requests are rejected until the recovery timeout passes.
//! - HALF_OPEN: a bounded number of test requests is admitted.
//!
//! Transitions: CLOSED→OPEN when the failure count reaches the threshold;
//! OPEN→HALF_OPEN when the recovery timeout has elapsed (the transition
//! itself admits the first test request); HALF_OPEN→CLOSED on success;
//! HALF_OPEN→OPEN on failure.
//!
//! State lives in a shared key-value store under a configurable prefix so
//! that every worker observes the same breaker. All transitions use the
//! store's atomic primitives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

/// Raised to callers when the breaker rejects a request.
#[derive(Debug, Error)]
#[error("circuit breaker is open (retry after {retry_after:.0}s)")]
pub struct CircuitOpen {
    /// Estimated seconds until the OPEN → HALF_OPEN transition.
    pub retry_after: f64,
}

#[derive(Debug, Error)]
pub enum BreakerStoreError {
    #[error("breaker store unavailable: {0}")]
    Unavailable(String),
}

/// Shared key-value storage for breaker state.
///
/// Keys are derived from a prefix: `{prefix}:state`, `{prefix}:failures`,
/// `{prefix}:opened_at`, `{prefix}:half_open_calls`. Transition methods must
/// apply their writes atomically.
#[async_trait]
pub trait BreakerStateStore: Send + Sync {
    async fn get_state(&self, prefix: &str) -> Result<Option<CircuitState>, BreakerStoreError>;

    /// Atomically: state = OPEN, opened_at = given unix timestamp.
    async fn transition_to_open(
        &self,
        prefix: &str,
        opened_at: f64,
    ) -> Result<(), BreakerStoreError>;

    /// Atomically: state = HALF_OPEN, half_open_calls = 0.
    async fn transition_to_half_open(&self, prefix: &str) -> Result<(), BreakerStoreError>;

    /// Atomically: state = CLOSED, failures = 0, opened_at and
    /// half_open_calls removed.
    async fn transition_to_closed(&self, prefix: &str) -> Result<(), BreakerStoreError>;

    /// Increment and return the failure counter.
    async fn incr_failures(&self, prefix: &str) -> Result<u64, BreakerStoreError>;

    async fn reset_failures(&self, prefix: &str) -> Result<(), BreakerStoreError>;

    /// Increment and return the half-open admission counter.
    async fn incr_half_open_calls(&self, prefix: &str) -> Result<u64, BreakerStoreError>;

    async fn get_opened_at(&self, prefix: &str) -> Result<Option<f64>, BreakerStoreError>;

    /// Remove every key under the prefix (back to initial CLOSED state).
    async fn clear(&self, prefix: &str) -> Result<(), BreakerStoreError>;
}

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures before the circuit opens.
    pub failure_threshold: u64,
    /// How long to stay OPEN before admitting a test request.
    pub recovery_timeout: Duration,
    /// Max admitted requests while HALF_OPEN.
    pub half_open_max_calls: u64,
    /// Key prefix in the shared store.
    pub key_prefix: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            key_prefix: "inference_circuit".to_string(),
        }
    }
}

type ClockFn = dyn Fn() -> f64 + Send + Sync;

/// Distributed three-state circuit breaker.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn BreakerStateStore>,
    config: BreakerConfig,
    clock: Arc<ClockFn>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn BreakerStateStore>, config: BreakerConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis() as f64 / 1000.0),
        }
    }

    /// Replace the wall clock (tests only).
    pub fn with_clock(mut self, clock: Arc<ClockFn>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn now(&self) -> f64 {
        (self.clock)()
    }

    fn prefix(&self) -> &str {
        &self.config.key_prefix
    }

    pub async fn state(&self) -> Result<CircuitState, BreakerStoreError> {
        Ok(self
            .store
            .get_state(self.prefix())
            .await?
            .unwrap_or(CircuitState::Closed))
    }

    /// Whether a request should be admitted right now.
    ///
    /// OPEN → HALF_OPEN happens here once the recovery timeout has elapsed;
    /// that transition also admits the calling request, acting as the atomic
    /// test admission. In HALF_OPEN the store's counter bounds admissions to
    /// `half_open_max_calls` across all concurrent workers.
    pub async fn allow_request(&self) -> Result<bool, BreakerStoreError> {
        match self.state().await? {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => {
                if let Some(opened_at) = self.store.get_opened_at(self.prefix()).await? {
                    let elapsed = self.now() - opened_at;
                    if elapsed >= self.config.recovery_timeout.as_secs_f64() {
                        self.store.transition_to_half_open(self.prefix()).await?;
                        info!(prefix = self.prefix(), "circuit breaker half-open, admitting test request");
                        return Ok(true);
                    }
                }
                debug!(prefix = self.prefix(), "circuit is open, rejecting request");
                Ok(false)
            }
            CircuitState::HalfOpen => {
                let calls = self.store.incr_half_open_calls(self.prefix()).await?;
                if calls <= self.config.half_open_max_calls {
                    debug!(prefix = self.prefix(), calls, "half-open admission");
                    Ok(true)
                } else {
                    debug!(prefix = self.prefix(), calls, "half-open limit reached, rejecting");
                    Ok(false)
                }
            }
        }
    }

    /// Record a successful request.
    ///
    /// HALF_OPEN → CLOSED (recovery confirmed); in CLOSED the failure count
    /// resets so stale failures never accumulate.
    pub async fn record_success(&self) -> Result<(), BreakerStoreError> {
        match self.state().await? {
            CircuitState::HalfOpen => {
                info!(prefix = self.prefix(), "successful test request, closing circuit");
                self.store.transition_to_closed(self.prefix()).await
            }
            CircuitState::Closed => self.store.reset_failures(self.prefix()).await,
            CircuitState::Open => Ok(()),
        }
    }

    /// Record a failed request.
    ///
    /// HALF_OPEN → OPEN (recovery failed); in CLOSED the failure counter is
    /// incremented and the circuit opens at the threshold.
    pub async fn record_failure(&self) -> Result<(), BreakerStoreError> {
        match self.state().await? {
            CircuitState::HalfOpen => {
                warn!(prefix = self.prefix(), "test request failed, reopening circuit");
                self.store.transition_to_open(self.prefix(), self.now()).await
            }
            CircuitState::Closed => {
                let failures = self.store.incr_failures(self.prefix()).await?;
                debug!(
                    prefix = self.prefix(),
                    failures,
                    threshold = self.config.failure_threshold,
                    "recorded inference failure"
                );
                if failures >= self.config.failure_threshold {
                    warn!(prefix = self.prefix(), failures, "failure threshold reached, opening circuit");
                    self.store.transition_to_open(self.prefix(), self.now()).await?;
                }
                Ok(())
            }
            CircuitState::Open => Ok(()),
        }
    }

    /// Seconds until the OPEN → HALF_OPEN transition, or 0 when not OPEN.
    pub async fn get_retry_after(&self) -> Result<f64, BreakerStoreError> {
        if self.state().await? != CircuitState::Open {
            return Ok(0.0);
        }

        let Some(opened_at) = self.store.get_opened_at(self.prefix()).await? else {
            return Ok(0.0);
        };

        let elapsed = self.now() - opened_at;
        Ok((self.config.recovery_timeout.as_secs_f64() - elapsed).max(0.0))
    }

    /// Reset to the initial CLOSED state (tests and operational tooling).
    pub async fn reset(&self) -> Result<(), BreakerStoreError> {
        self.store.clear(self.prefix()).await
    }

    /// Build the rejection error callers surface upstream.
    pub async fn open_error(&self) -> Result<CircuitOpen, BreakerStoreError> {
        Ok(CircuitOpen {
            retry_after: self.get_retry_after().await?,
        })
    }
}

#[derive(Debug, Default)]
struct BreakerCells {
    state: Option<CircuitState>,
    failures: u64,
    opened_at: Option<f64>,
    half_open_calls: u64,
}

/// Process-local breaker store for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryBreakerStore {
    cells: Mutex<HashMap<String, BreakerCells>>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_cell<T>(&self, prefix: &str, f: impl FnOnce(&mut BreakerCells) -> T) -> T {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        f(cells.entry(prefix.to_string()).or_default())
    }
}

#[async_trait]
impl BreakerStateStore for InMemoryBreakerStore {
    async fn get_state(&self, prefix: &str) -> Result<Option<CircuitState>, BreakerStoreError> {
        Ok(self.with_cell(prefix, |c| c.state))
    }

    async fn transition_to_open(
        &self,
        prefix: &str,
        opened_at: f64,
    ) -> Result<(), BreakerStoreError> {
        self.with_cell(prefix, |c| {
            c.state = Some(CircuitState::Open);
            c.opened_at = Some(opened_at);
        });
        Ok(())
    }

    async fn transition_to_half_open(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        self.with_cell(prefix, |c| {
            c.state = Some(CircuitState::HalfOpen);
            c.half_open_calls = 0;
        });
        Ok(())
    }

    async fn transition_to_closed(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        self.with_cell(prefix, |c| {
            c.state = Some(CircuitState::Closed);
            c.failures = 0;
            c.opened_at = None;
            c.half_open_calls = 0;
        });
        Ok(())
    }

    async fn incr_failures(&self, prefix: &str) -> Result<u64, BreakerStoreError> {
        Ok(self.with_cell(prefix, |c| {
            c.failures += 1;
            c.failures
        }))
    }

    async fn reset_failures(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        self.with_cell(prefix, |c| c.failures = 0);
        Ok(())
    }

    async fn incr_half_open_calls(&self, prefix: &str) -> Result<u64, BreakerStoreError> {
        Ok(self.with_cell(prefix, |c| {
            c.half_open_calls += 1;
            c.half_open_calls
        }))
    }

    async fn get_opened_at(&self, prefix: &str) -> Result<Option<f64>, BreakerStoreError> {
        Ok(self.with_cell(prefix, |c| c.opened_at))
    }

    async fn clear(&self, prefix: &str) -> Result<(), BreakerStoreError> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells.remove(prefix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn breaker_with_manual_clock(
        config: BreakerConfig,
    ) -> (CircuitBreaker, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(1_000_000));
        let clock_now = now.clone();
        let breaker = CircuitBreaker::new(Arc::new(InMemoryBreakerStore::new()), config)
            .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst) as f64));
        (breaker, now)
    }

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            key_prefix: "test_circuit".to_string(),
        }
    }

    #[tokio::test]
    async fn closed_circuit_allows_requests() {
        let (breaker, _) = breaker_with_manual_clock(test_config());
        assert!(breaker.allow_request().await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let (breaker, _) = breaker_with_manual_clock(test_config());

        breaker.record_failure().await.unwrap();
        breaker.record_failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);

        breaker.record_failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert!(!breaker.allow_request().await.unwrap());
    }

    #[tokio::test]
    async fn success_in_closed_state_resets_failures() {
        let (breaker, _) = breaker_with_manual_clock(test_config());

        breaker.record_failure().await.unwrap();
        breaker.record_failure().await.unwrap();
        breaker.record_success().await.unwrap();

        // Two more failures do not reach the threshold of three.
        breaker.record_failure().await.unwrap();
        breaker.record_failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn recovery_timeout_admits_one_test_request() {
        let (breaker, now) = breaker_with_manual_clock(test_config());

        for _ in 0..3 {
            breaker.record_failure().await.unwrap();
        }
        assert!(!breaker.allow_request().await.unwrap());
        assert!(breaker.get_retry_after().await.unwrap() > 0.0);

        now.fetch_add(61, Ordering::SeqCst);

        // First call after the timeout transitions to HALF_OPEN and is admitted.
        assert!(breaker.allow_request().await.unwrap());
        assert_eq!(breaker.state().await.unwrap(), CircuitState::HalfOpen);

        // With half_open_max_calls = 1, the next call is rejected.
        assert!(!breaker.allow_request().await.unwrap());

        breaker.record_success().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.get_retry_after().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let (breaker, now) = breaker_with_manual_clock(test_config());

        for _ in 0..3 {
            breaker.record_failure().await.unwrap();
        }
        now.fetch_add(61, Ordering::SeqCst);
        assert!(breaker.allow_request().await.unwrap());

        breaker.record_failure().await.unwrap();
        assert_eq!(breaker.state().await.unwrap(), CircuitState::Open);
        assert!(!breaker.allow_request().await.unwrap());
    }

    #[tokio::test]
    async fn reset_returns_to_initial_state() {
        let (breaker, _) = breaker_with_manual_clock(test_config());

        for _ in 0..3 {
            breaker.record_failure().await.unwrap();
        }
        breaker.reset().await.unwrap();

        assert_eq!(breaker.state().await.unwrap(), CircuitState::Closed);
        assert!(breaker.allow_request().await.unwrap());
    }
}
