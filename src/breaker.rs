//! Circuit breaker for guarding calls to a single dependency.
//!
//! The breaker rejects calls while the guarded dependency is presumed
//! unhealthy and probes recovery with a bounded number of trial calls.
//!
//! ## States
//!
//! - **Closed**: calls pass through; successes decay the failure count
//! - **Open**: calls are rejected until the recovery timeout elapses
//! - **Half-Open**: a bounded number of trial calls probe recovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use gantry::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("payments")
//!         .failure_threshold(5)
//!         .recovery_timeout(Duration::from_secs(30)),
//! );
//!
//! match breaker.execute(|| async { payment_gateway.charge(&order).await }).await {
//!     Ok(receipt) => handle(receipt),
//!     Err(CircuitBreakerError::Open { retry_at }) => schedule_retry(retry_at),
//!     Err(CircuitBreakerError::HalfOpenLimitReached) => back_off(),
//!     Err(CircuitBreakerError::Execution(e)) => report(e),
//! }
//! ```

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// A bounded number of trial calls are admitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the guarded dependency (for logging/metrics).
    pub name: String,
    /// Consecutive counted failures before the circuit opens. Must be >= 1.
    pub failure_threshold: u32,
    /// Time to wait before admitting a trial call after opening.
    pub recovery_timeout: Duration,
    /// Metrics aggregation window. Informational only.
    pub monitoring_period: Duration,
    /// Error kinds that count toward the breaker. Empty means all errors count.
    pub expected_errors: Vec<String>,
    /// Trial calls admitted in half-open state.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(60),
            expected_errors: Vec::new(),
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the metrics aggregation window.
    pub fn monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }

    /// Add an error kind that counts toward the breaker.
    pub fn expected_error(mut self, kind: impl Into<String>) -> Self {
        self.expected_errors.push(kind.into());
        self
    }

    /// Set the number of trial calls admitted in half-open state.
    pub fn half_open_max_calls(mut self, count: u32) -> Self {
        self.half_open_max_calls = count;
        self
    }
}

/// Circuit breaker error.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was not invoked.
    Open {
        /// Earliest time a trial call will be admitted.
        retry_at: Instant,
    },
    /// All half-open trial slots are taken; the operation was not invoked.
    HalfOpenLimitReached,
    /// The operation was invoked and failed.
    Execution(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { retry_at } => {
                let wait = retry_at.saturating_duration_since(Instant::now());
                write!(f, "circuit breaker is open, retry in {:?}", wait)
            }
            Self::HalfOpenLimitReached => write!(f, "half-open trial limit reached"),
            Self::Execution(e) => write!(f, "execution failed: {}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitBreakerError<E> {}

/// State guarded by the breaker mutex. Transitions are atomic with respect
/// to concurrent `execute` calls.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
}

enum Admission {
    Admitted,
    RejectedOpen(Instant),
    RejectedHalfOpen,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Counted failures toward the current threshold.
    pub failure_count: u32,
    /// Successes recorded in the current half-open probe.
    pub success_count: u32,
    /// Total calls seen, including rejected ones.
    pub total_requests: u64,
    /// Total successful executions.
    pub total_successes: u64,
    /// Total failed executions (counted or not).
    pub total_failures: u64,
    /// Total rejections without execution.
    pub total_rejections: u64,
    /// Most recent counted failure.
    pub last_failure_at: Option<Instant>,
    /// Next trial admission time while open.
    pub next_attempt_at: Option<Instant>,
}

impl CircuitBreakerMetrics {
    /// Failure rate over executed calls (0.0 - 1.0).
    pub fn failure_rate(&self) -> f64 {
        let executed = self.total_successes + self.total_failures;
        if executed == 0 {
            0.0
        } else {
            self.total_failures as f64 / executed as f64
        }
    }
}

/// Per-dependency fault-isolation state machine.
///
/// One breaker guards one logical dependency; it holds no references to the
/// instances behind that dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            recovery_timeout = ?config.recovery_timeout,
            "circuit breaker initialized"
        );

        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                last_failure_at: None,
                next_attempt_at: None,
            }),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// The name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state. This is a passive snapshot: the open to half-open
    /// transition happens only when a call is admitted, never here.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Execute an operation with every error counting toward the breaker.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_inner(op, |_| true).await
    }

    /// Execute an operation, counting only errors whose kind is in the
    /// configured allow-list.
    ///
    /// With an empty allow-list every error counts. An error whose kind is
    /// not listed propagates to the caller without affecting breaker state.
    pub async fn execute_classified<F, Fut, T, E, K>(
        &self,
        op: F,
        kind_of: K,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        K: Fn(&E) -> &str,
    {
        self.execute_inner(op, |e| {
            self.config.expected_errors.is_empty()
                || self
                    .config
                    .expected_errors
                    .iter()
                    .any(|k| k.as_str() == kind_of(e))
        })
        .await
    }

    async fn execute_inner<F, Fut, T, E, C>(
        &self,
        op: F,
        is_counted: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match self.try_admit() {
            Admission::Admitted => {}
            Admission::RejectedOpen(retry_at) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.config.name, "circuit breaker rejected call");
                return Err(CircuitBreakerError::Open { retry_at });
            }
            Admission::RejectedHalfOpen => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitBreakerError::HalfOpenLimitReached);
            }
        }

        match op().await {
            Ok(value) => {
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                if is_counted(&e) {
                    self.on_counted_failure();
                }
                Err(CircuitBreakerError::Execution(e))
            }
        }
    }

    /// Decide whether a call may proceed. Only one caller performs the
    /// open to half-open transition; the rest see the updated state.
    fn try_admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Admitted,
            CircuitState::Open => {
                let next_attempt = inner
                    .next_attempt_at
                    .unwrap_or_else(Instant::now);
                if Instant::now() >= next_attempt {
                    debug!(name = %self.config.name, "circuit breaker transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_calls = 1;
                    inner.success_count = 0;
                    Admission::Admitted
                } else {
                    Admission::RejectedOpen(next_attempt)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    Admission::Admitted
                } else {
                    Admission::RejectedHalfOpen
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                // Successes decay the failure count rather than resetting it
                if inner.failure_count > 0 {
                    inner.failure_count -= 1;
                }
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_max_calls {
                    self.close(&mut inner);
                }
            }
            CircuitState::Open => {
                debug!(name = %self.config.name, "success recorded while circuit open");
            }
        }
    }

    fn on_counted_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // A single failure while probing reopens the circuit
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        warn!(
            name = %self.config.name,
            failures = inner.failure_count,
            "circuit breaker OPENED"
        );
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(Instant::now() + self.config.recovery_timeout);
        inner.half_open_calls = 0;
        inner.success_count = 0;
    }

    fn close(&self, inner: &mut BreakerInner) {
        info!(name = %self.config.name, "circuit breaker CLOSED");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        inner.next_attempt_at = None;
    }

    /// Force the breaker closed and zero all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.close(&mut inner);
        inner.last_failure_at = None;
    }

    /// Snapshot current and lifetime metrics.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt_at,
        }
    }
}
