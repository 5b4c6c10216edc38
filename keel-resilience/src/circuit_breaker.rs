//! Circuit breaker pattern implementation
//!
//! One breaker guards one logical dependency. State and the trailing
//! outcome windows live behind a single mutex so every transition check is
//! linearizable with the window mutation that triggered it. Transitions are
//! evaluated lazily on call entry: an open breaker only moves to half-open
//! when somebody tries to call through it, so [`CircuitBreaker::state`] may
//! report a stale `Open` between calls.

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, SharedClock};
use crate::error::{ConfigError, ConfigResult, ErrorClassifier, ResilienceError};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests are blocked
    Open,
    /// Circuit is half-open, a single probe tests recovery
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

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that trip the breaker
    pub failure_threshold: u32,

    /// Consecutive half-open successes needed to close again
    pub success_threshold: u32,

    /// Time to stay open before admitting a probe
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,

    /// Trailing window for counting outcomes
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Optional failure ratio that also trips the breaker
    pub failure_ratio: Option<f64>,

    /// Minimum calls in the window before the ratio is evaluated
    pub min_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
            window: Duration::from_secs(300),
            failure_ratio: None,
            min_requests: 5,
        }
    }
}

impl CircuitBreakerConfig {
    /// Check ranges; invalid configurations never reach a breaker
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold < 1 {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "failure_threshold must be at least 1",
            ));
        }
        if self.success_threshold < 1 {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "success_threshold must be at least 1",
            ));
        }
        if self.open_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "open_timeout must be greater than 0",
            ));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid(
                "circuit_breaker",
                "window must be greater than 0",
            ));
        }
        if let Some(ratio) = self.failure_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::invalid(
                    "circuit_breaker",
                    format!("failure_ratio must be in (0, 1], got {}", ratio),
                ));
            }
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Dependency name
    pub dependency: String,
    /// Current state (may be stale-open, see module docs)
    pub state: CircuitState,
    /// Classified failures inside the trailing window
    pub failures_in_window: usize,
    /// Successes inside the trailing window
    pub successes_in_window: usize,
    /// Consecutive probe successes while half-open
    pub consecutive_successes: u32,
    /// Time since the last state change
    #[serde(with = "humantime_serde")]
    pub since_transition: Duration,
    /// Cumulative successful calls
    pub total_successes: u64,
    /// Cumulative classified failures
    pub total_failures: u64,
    /// Cumulative calls rejected by the breaker
    pub total_rejected: u64,
    /// Cumulative outcomes that did not count either way
    pub total_ignored: u64,
    /// Number of closed/half-open to open transitions
    pub trips: u64,
}

/// Thread-safe circuit breaker implementation
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    clock: SharedClock,
    state: Arc<Mutex<BreakerState>>,
}

struct BreakerState {
    state: CircuitState,
    failure_window: VecDeque<Instant>,
    success_window: VecDeque<Instant>,
    consecutive_successes: u32,
    last_transition: Instant,
    // Bumped on every transition so permits from an older episode cannot
    // release the current probe slot.
    generation: u64,
    probe_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejected: u64,
    total_ignored: u64,
    trips: u64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, system_clock())
    }

    /// Create a circuit breaker reading time from `clock`
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> ConfigResult<Self> {
        config.validate()?;
        let now = clock.now();
        let name: String = name.into();

        Ok(Self {
            name: Arc::from(name),
            config: Arc::new(config),
            clock,
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_window: VecDeque::new(),
                success_window: VecDeque::new(),
                consecutive_successes: 0,
                last_transition: now,
                generation: 0,
                probe_in_flight: false,
                total_successes: 0,
                total_failures: 0,
                total_rejected: 0,
                total_ignored: 0,
                trips: 0,
            })),
        })
    }

    /// Name of the protected dependency
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state without evaluating pending transitions
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Whether a call arriving now would be let through
    ///
    /// Unlike [`CircuitBreaker::try_acquire`] this does not transition or
    /// reserve the probe slot.
    pub fn is_call_permitted(&self) -> bool {
        let now = self.clock.now();
        let state = self.state.lock();

        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                now.saturating_duration_since(state.last_transition) >= self.config.open_timeout
            }
            CircuitState::HalfOpen => !state.probe_in_flight,
        }
    }

    /// Ask for permission to call the dependency
    ///
    /// Returns a [`CallPermit`] that must be settled with the call outcome.
    /// A permit dropped without being settled releases its probe slot.
    pub fn try_acquire<E>(&self) -> Result<CallPermit<'_>, ResilienceError<E>> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => Ok(CallPermit::new(self, None)),
            CircuitState::Open => {
                let since = now.saturating_duration_since(state.last_transition);
                if since >= self.config.open_timeout {
                    self.transition_to_half_open(&mut state, now);
                    state.probe_in_flight = true;
                    Ok(CallPermit::new(self, Some(state.generation)))
                } else {
                    state.total_rejected += 1;
                    Err(self.open_error(since))
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    state.total_rejected += 1;
                    let since = now.saturating_duration_since(state.last_transition);
                    Err(self.open_error(since))
                } else {
                    state.probe_in_flight = true;
                    Ok(CallPermit::new(self, Some(state.generation)))
                }
            }
        }
    }

    /// Run `f` through the breaker, classifying its error with `classifier`
    pub async fn execute<F, Fut, T, E>(
        &self,
        classifier: &ErrorClassifier<E>,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call(classifier, || async move { f().await.map_err(ResilienceError::Operation) })
            .await
    }

    /// Run an already-layered call through the breaker
    ///
    /// Work errors (plain or retry-exhausted) are classified; cancellation
    /// and nested rejections are ignored; a contained panic counts as a failure.
    pub async fn call<F, Fut, T, E>(
        &self,
        classifier: &ErrorClassifier<E>,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let permit = self.try_acquire()?;
        let result = f().await;

        match &result {
            Ok(_) => permit.record_success(),
            Err(ResilienceError::Operation(error))
            | Err(ResilienceError::RetryExhausted {
                last_error: error, ..
            }) => {
                if classifier.classify(error) {
                    permit.record_failure();
                } else {
                    permit.record_ignored();
                }
            }
            Err(ResilienceError::Panicked { .. }) => permit.record_failure(),
            Err(_) => permit.record_ignored(),
        }

        result
    }

    /// Count a failure that did not go through a permit
    ///
    /// Used when admission-control rejections are configured to feed the breaker.
    pub fn record_external_failure(&self) {
        self.settle(None, Outcome::Failure);
    }

    /// Snapshot of state and counters
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.prune(&mut state, now);

        CircuitSnapshot {
            dependency: self.name.to_string(),
            state: state.state,
            failures_in_window: state.failure_window.len(),
            successes_in_window: state.success_window.len(),
            consecutive_successes: state.consecutive_successes,
            since_transition: now.saturating_duration_since(state.last_transition),
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            total_rejected: state.total_rejected,
            total_ignored: state.total_ignored,
            trips: state.trips,
        }
    }

    /// Reset the circuit breaker to closed state
    ///
    /// Cumulative counters are kept.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.transition_to_closed(&mut state, now);
        info!("Circuit breaker '{}' manually reset", self.name);
    }

    /// Open the breaker immediately
    pub fn force_open(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.transition_to_open(&mut state, now);
        warn!("Circuit breaker '{}' forced open", self.name);
    }

    // Internal methods

    fn open_error<E>(&self, since: Duration) -> ResilienceError<E> {
        debug!("Circuit breaker '{}' rejected call", self.name);
        ResilienceError::CircuitOpen {
            dependency: self.name.to_string(),
            since_transition: since,
        }
    }

    fn settle(&self, probe: Option<u64>, outcome: Outcome) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.prune(&mut state, now);

        let current_probe = probe == Some(state.generation) && state.probe_in_flight;
        if current_probe {
            state.probe_in_flight = false;
        }

        match outcome {
            Outcome::Success => {
                state.total_successes += 1;
                state.success_window.push_back(now);

                if state.state == CircuitState::HalfOpen && current_probe {
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        self.transition_to_closed(&mut state, now);
                    }
                }
            }
            Outcome::Failure => {
                state.total_failures += 1;
                state.failure_window.push_back(now);

                match state.state {
                    CircuitState::Closed => {
                        if self.should_open(&state) {
                            self.transition_to_open(&mut state, now);
                        }
                    }
                    CircuitState::HalfOpen => self.transition_to_open(&mut state, now),
                    CircuitState::Open => {}
                }
            }
            Outcome::Ignored => {
                state.total_ignored += 1;
            }
        }
    }

    fn should_open(&self, state: &BreakerState) -> bool {
        let failures = state.failure_window.len();
        if failures >= self.config.failure_threshold as usize {
            return true;
        }

        match self.config.failure_ratio {
            Some(ratio) => {
                let total = failures + state.success_window.len();
                total >= self.config.min_requests as usize
                    && total > 0
                    && failures as f64 / total as f64 >= ratio
            }
            None => false,
        }
    }

    fn prune(&self, state: &mut BreakerState, now: Instant) {
        let window = self.config.window;
        for entries in [&mut state.failure_window, &mut state.success_window] {
            while let Some(&oldest) = entries.front() {
                if now.saturating_duration_since(oldest) >= window {
                    entries.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn transition_to_open(&self, state: &mut BreakerState, now: Instant) {
        let failures = state.failure_window.len();
        state.state = CircuitState::Open;
        state.last_transition = now;
        state.consecutive_successes = 0;
        state.probe_in_flight = false;
        state.generation += 1;
        state.trips += 1;
        warn!(
            "Circuit breaker '{}' opened with {} failures in window",
            self.name, failures
        );
    }

    fn transition_to_closed(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::Closed;
        state.last_transition = now;
        state.consecutive_successes = 0;
        state.probe_in_flight = false;
        state.generation += 1;
        state.failure_window.clear();
        state.success_window.clear();
        info!("Circuit breaker '{}' closed after successful recovery", self.name);
    }

    fn transition_to_half_open(&self, state: &mut BreakerState, now: Instant) {
        state.state = CircuitState::HalfOpen;
        state.last_transition = now;
        state.consecutive_successes = 0;
        state.probe_in_flight = false;
        state.generation += 1;
        info!("Circuit breaker '{}' transitioned to half-open state", self.name);
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Permission to make one call through a [`CircuitBreaker`]
#[must_use = "a permit must be settled with the call outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: Option<u64>) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    /// Whether this permit is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// The call succeeded
    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.settle(self.probe, Outcome::Success);
    }

    /// The call failed in a way that counts against the dependency
    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.probe, Outcome::Failure);
    }

    /// The call ended without saying anything about dependency health
    pub fn record_ignored(mut self) {
        self.settled = true;
        self.breaker.settle(self.probe, Outcome::Ignored);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.probe, Outcome::Ignored);
        }
    }
}

/// Builder for circuit breakers
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    clock: Option<SharedClock>,
}

impl CircuitBreakerBuilder {
    /// Create a new builder with default config
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            clock: None,
        }
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set success threshold for recovery
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set time to wait before admitting a probe
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.config.open_timeout = timeout;
        self
    }

    /// Set time window for failure counting
    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    /// Trip on failure ratio once `min_requests` calls are in the window
    pub fn failure_ratio(mut self, ratio: f64, min_requests: u32) -> Self {
        self.config.failure_ratio = Some(ratio);
        self.config.min_requests = min_requests;
        self
    }

    /// Use a custom clock
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> ConfigResult<CircuitBreaker> {
        let clock = self.clock.unwrap_or_else(system_clock);
        CircuitBreaker::with_clock(self.name, self.config, clock)
    }
}
