//! Graceful degradation
//!
//! A [`DegradationManager`] tracks a health level per named feature and
//! routes each call to the primary path, a fallback or a static default
//! depending on that level. Levels come from forced operator overrides,
//! registered [`HealthCheck`] probes, or in-memory demotion after a primary
//! failure.

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::clock::{system_clock, SharedClock};
use crate::error::{ConfigError, ConfigResult};

/// Service level of a feature, ordered from best to worst
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    /// Primary path
    #[default]
    Full,
    /// Fallback path
    Degraded,
    /// Fallback path, dependency known to be failing
    Minimal,
    /// Static default only
    Unavailable,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthLevel::Full => write!(f, "full"),
            HealthLevel::Degraded => write!(f, "degraded"),
            HealthLevel::Minimal => write!(f, "minimal"),
            HealthLevel::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl From<bool> for HealthLevel {
    fn from(healthy: bool) -> Self {
        if healthy {
            HealthLevel::Full
        } else {
            HealthLevel::Minimal
        }
    }
}

/// A health probe failed to produce a level
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Health check failed: {message}")]
pub struct HealthCheckError {
    pub message: String,
}

impl HealthCheckError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Asynchronous probe reporting the level a feature can serve at
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<HealthLevel, HealthCheckError>;
}

struct FnHealthCheck<F> {
    probe: F,
}

#[async_trait]
impl<F, Fut, L> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<L, HealthCheckError>> + Send,
    L: Into<HealthLevel> + Send,
{
    async fn check(&self) -> Result<HealthLevel, HealthCheckError> {
        (self.probe)().await.map(Into::into)
    }
}

/// Wrap an async closure as a [`HealthCheck`]
///
/// The closure may report a [`HealthLevel`] or a plain `bool`
/// (`true` is `Full`, `false` is `Minimal`).
pub fn health_check_fn<F, Fut, L>(probe: F) -> Arc<dyn HealthCheck>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<L, HealthCheckError>> + Send + 'static,
    L: Into<HealthLevel> + Send + 'static,
{
    Arc::new(FnHealthCheck { probe })
}

/// Derives a feature level from a circuit breaker
///
/// | breaker                         | level      |
/// |---------------------------------|------------|
/// | closed                          | `Full`     |
/// | open, timeout elapsed           | `Full`     |
/// | half-open, probe slot free      | `Full`     |
/// | half-open, probe in flight      | `Degraded` |
/// | open, within timeout            | `Minimal`  |
///
/// Reporting `Full` once a probe would be admitted lets the primary path
/// carry the breaker's recovery probe.
#[derive(Debug, Clone)]
pub struct CircuitBreakerHealthCheck {
    breaker: CircuitBreaker,
}

impl CircuitBreakerHealthCheck {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    /// Level for the breaker's current state
    pub fn level(&self) -> HealthLevel {
        let state = self.breaker.state();
        if self.breaker.is_call_permitted() {
            return HealthLevel::Full;
        }
        match state {
            CircuitState::Closed => HealthLevel::Full,
            CircuitState::HalfOpen => HealthLevel::Degraded,
            CircuitState::Open => HealthLevel::Minimal,
        }
    }
}

#[async_trait]
impl HealthCheck for CircuitBreakerHealthCheck {
    async fn check(&self) -> Result<HealthLevel, HealthCheckError> {
        Ok(self.level())
    }
}

/// Per-feature settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Level before any probe or failure has been observed
    pub initial_level: HealthLevel,

    /// Upper bound on a single health probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// How long a failure demotion lasts for features without a probe
    #[serde(with = "humantime_serde")]
    pub demotion_ttl: Duration,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            initial_level: HealthLevel::Full,
            probe_timeout: Duration::from_secs(1),
            demotion_ttl: Duration::from_secs(30),
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.probe_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "feature",
                "probe_timeout must be greater than 0",
            ));
        }
        if self.demotion_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "feature",
                "demotion_ttl must be greater than 0",
            ));
        }
        Ok(())
    }
}

type FallbackValue = Arc<dyn Any + Send + Sync>;

/// Everything needed to register one feature
pub struct FeatureRegistration {
    name: String,
    config: FeatureConfig,
    health_check: Option<Arc<dyn HealthCheck>>,
    fallback_value: Option<FallbackValue>,
}

impl FeatureRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: FeatureConfig::default(),
            health_check: None,
            fallback_value: None,
        }
    }

    pub fn config(mut self, config: FeatureConfig) -> Self {
        self.config = config;
        self
    }

    pub fn health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Static default served when neither primary nor fallback can answer
    pub fn fallback_value<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.fallback_value = Some(Arc::new(value));
        self
    }
}

/// Degradation manager errors
///
/// Only misuse surfaces here; dependency failures are absorbed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DegradationError {
    #[error("Unknown feature '{0}'")]
    UnknownFeature(String),

    #[error("Feature '{0}' is already registered")]
    DuplicateFeature(String),

    #[error("Feature '{feature}' is unavailable and has no default value")]
    FeatureUnavailable { feature: String },

    #[error("Default value for feature '{feature}' is not a {expected}")]
    FallbackTypeMismatch {
        feature: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Counters and current level for one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub feature: String,
    pub level: HealthLevel,
    pub forced: Option<HealthLevel>,
    pub primary_successes: u64,
    pub primary_failures: u64,
    pub fallback_successes: u64,
    pub fallback_failures: u64,
    pub defaults_served: u64,
    pub unavailable_skips: u64,
    pub cancelled: u64,
    pub probe_failures: u64,
}

#[derive(Default)]
struct FeatureCounters {
    primary_successes: AtomicU64,
    primary_failures: AtomicU64,
    fallback_successes: AtomicU64,
    fallback_failures: AtomicU64,
    defaults_served: AtomicU64,
    unavailable_skips: AtomicU64,
    cancelled: AtomicU64,
    probe_failures: AtomicU64,
}

struct FeatureState {
    level: HealthLevel,
    forced: Option<HealthLevel>,
    demoted_at: Option<Instant>,
}

struct Feature {
    name: String,
    config: FeatureConfig,
    health_check: Option<Arc<dyn HealthCheck>>,
    fallback_value: Option<FallbackValue>,
    state: Mutex<FeatureState>,
    counters: FeatureCounters,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Registry of degradable features and their fallback chains
pub struct DegradationManager {
    features: RwLock<HashMap<String, Arc<Feature>>>,
    clock: SharedClock,
}

impl std::fmt::Debug for DegradationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationManager")
            .field("features", &self.features())
            .finish()
    }
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DegradationManager {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a manager whose demotion expiry reads time from `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            features: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register a feature with default settings
    pub fn register_feature<T: Any + Send + Sync>(
        &self,
        name: impl Into<String>,
        health_check: Option<Arc<dyn HealthCheck>>,
        fallback_value: Option<T>,
    ) -> Result<(), DegradationError> {
        let mut registration = FeatureRegistration::new(name);
        registration.health_check = health_check;
        registration.fallback_value = fallback_value.map(|v| Arc::new(v) as FallbackValue);
        self.register(registration)
    }

    /// Register a feature
    pub fn register(&self, registration: FeatureRegistration) -> Result<(), DegradationError> {
        registration.config.validate()?;

        let mut features = self.features.write();
        if features.contains_key(&registration.name) {
            return Err(DegradationError::DuplicateFeature(registration.name));
        }

        let feature = Feature {
            state: Mutex::new(FeatureState {
                level: registration.config.initial_level,
                forced: None,
                demoted_at: None,
            }),
            name: registration.name.clone(),
            config: registration.config,
            health_check: registration.health_check,
            fallback_value: registration.fallback_value,
            counters: FeatureCounters::default(),
        };
        info!(
            "Registered feature '{}' at level {} (probe: {}, default: {})",
            feature.name,
            feature.config.initial_level,
            feature.health_check.is_some(),
            feature.fallback_value.is_some()
        );
        features.insert(registration.name, Arc::new(feature));
        Ok(())
    }

    /// Registered feature names, sorted
    pub fn features(&self) -> Vec<String> {
        let mut names: Vec<String> = self.features.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `primary`, falling back to `fallback` and then the feature default
    pub async fn execute_with_fallback<T, E, P, PFut, F, FFut>(
        &self,
        cancel: &CancellationToken,
        feature: &str,
        primary: P,
        fallback: F,
    ) -> Result<T, DegradationError>
    where
        T: Clone + 'static,
        E: Display,
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, E>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, E>>,
    {
        self.run(cancel, feature, primary, Some(fallback)).await
    }

    /// Run `primary`, serving the feature default when it cannot answer
    pub async fn execute_or_default<T, E, P, PFut>(
        &self,
        cancel: &CancellationToken,
        feature: &str,
        primary: P,
    ) -> Result<T, DegradationError>
    where
        T: Clone + 'static,
        E: Display,
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, E>>,
    {
        self.run(
            cancel,
            feature,
            primary,
            None::<fn() -> std::future::Ready<Result<T, E>>>,
        )
        .await
    }

    /// Last known level of every feature
    ///
    /// Does not run probes; expired demotions are restored.
    pub fn health_snapshot(&self) -> HashMap<String, HealthLevel> {
        let features: Vec<Arc<Feature>> = self.features.read().values().cloned().collect();
        features
            .iter()
            .map(|feature| (feature.name.clone(), self.effective_level(feature)))
            .collect()
    }

    /// Pin a feature to `level` until [`DegradationManager::clear_override`]
    pub fn force_level(&self, feature: &str, level: HealthLevel) -> Result<(), DegradationError> {
        let feature = self.feature(feature)?;
        feature.state.lock().forced = Some(level);
        warn!("Feature '{}' forced to level {}", feature.name, level);
        Ok(())
    }

    /// Remove a forced level
    pub fn clear_override(&self, feature: &str) -> Result<(), DegradationError> {
        let feature = self.feature(feature)?;
        let previous = feature.state.lock().forced.take();
        if let Some(level) = previous {
            info!("Feature '{}' override {} cleared", feature.name, level);
        }
        Ok(())
    }

    /// Counters for one feature
    pub fn feature_stats(&self, feature: &str) -> Result<FeatureStats, DegradationError> {
        let feature = self.feature(feature)?;
        let level = self.effective_level(&feature);
        let forced = feature.state.lock().forced;
        let counters = &feature.counters;

        Ok(FeatureStats {
            feature: feature.name.clone(),
            level,
            forced,
            primary_successes: counters.primary_successes.load(Ordering::Relaxed),
            primary_failures: counters.primary_failures.load(Ordering::Relaxed),
            fallback_successes: counters.fallback_successes.load(Ordering::Relaxed),
            fallback_failures: counters.fallback_failures.load(Ordering::Relaxed),
            defaults_served: counters.defaults_served.load(Ordering::Relaxed),
            unavailable_skips: counters.unavailable_skips.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            probe_failures: counters.probe_failures.load(Ordering::Relaxed),
        })
    }

    async fn run<T, E, P, PFut, F, FFut>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        primary: P,
        fallback: Option<F>,
    ) -> Result<T, DegradationError>
    where
        T: Clone + 'static,
        E: Display,
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, E>>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, E>>,
    {
        let feature = self.feature(name)?;
        let counters = &feature.counters;

        if cancel.is_cancelled() {
            bump(&counters.cancelled);
            debug!("Feature '{}' call cancelled, serving default", feature.name);
            return self.serve_default(&feature, None);
        }

        let level = match self.resolve_level(&feature).await {
            HealthLevel::Unavailable => {
                bump(&counters.unavailable_skips);
                info!(
                    "Feature '{}' at level {}: skipping primary and fallback",
                    feature.name,
                    HealthLevel::Unavailable
                );
                return self.serve_default(&feature, Some(HealthLevel::Unavailable));
            }
            HealthLevel::Full => match primary().await {
                Ok(value) => {
                    bump(&counters.primary_successes);
                    debug!("Feature '{}' at level full: primary succeeded", feature.name);
                    return Ok(value);
                }
                Err(error) => {
                    bump(&counters.primary_failures);
                    self.demote(&feature, &error);
                    HealthLevel::Degraded
                }
            },
            level => level,
        };

        if let Some(fallback) = fallback {
            match fallback().await {
                Ok(value) => {
                    bump(&counters.fallback_successes);
                    info!(
                        "Feature '{}' at level {}: fallback succeeded",
                        feature.name, level
                    );
                    return Ok(value);
                }
                Err(error) => {
                    bump(&counters.fallback_failures);
                    warn!(
                        "Feature '{}' at level {}: fallback failed: {}",
                        feature.name, level, error
                    );
                }
            }
        }

        self.serve_default(&feature, Some(level))
    }

    fn feature(&self, name: &str) -> Result<Arc<Feature>, DegradationError> {
        self.features
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DegradationError::UnknownFeature(name.to_string()))
    }

    async fn resolve_level(&self, feature: &Feature) -> HealthLevel {
        let forced = feature.state.lock().forced;
        if let Some(level) = forced {
            return level;
        }

        let check = match &feature.health_check {
            Some(check) => check,
            None => return self.effective_level(feature),
        };

        let probed = match tokio::time::timeout(feature.config.probe_timeout, check.check()).await
        {
            Ok(Ok(level)) => level,
            Ok(Err(error)) => {
                bump(&feature.counters.probe_failures);
                warn!(
                    "Feature '{}' health check failed, assuming {}: {}",
                    feature.name,
                    HealthLevel::Minimal,
                    error
                );
                HealthLevel::Minimal
            }
            Err(_) => {
                bump(&feature.counters.probe_failures);
                warn!(
                    "Feature '{}' health check timed out after {:?}, assuming {}",
                    feature.name,
                    feature.config.probe_timeout,
                    HealthLevel::Minimal
                );
                HealthLevel::Minimal
            }
        };

        let mut state = feature.state.lock();
        if state.level != probed {
            info!(
                "Feature '{}' level {} -> {} (health check)",
                feature.name, state.level, probed
            );
        }
        state.level = probed;
        state.demoted_at = None;
        probed
    }

    fn effective_level(&self, feature: &Feature) -> HealthLevel {
        let now = self.clock.now();
        let mut state = feature.state.lock();

        if let Some(demoted_at) = state.demoted_at {
            if now.saturating_duration_since(demoted_at) >= feature.config.demotion_ttl {
                info!(
                    "Feature '{}' demotion expired, level {} -> {}",
                    feature.name, state.level, feature.config.initial_level
                );
                state.level = feature.config.initial_level;
                state.demoted_at = None;
            }
        }

        state.forced.unwrap_or(state.level)
    }

    fn demote(&self, feature: &Feature, error: &dyn Display) {
        let now = self.clock.now();
        let mut state = feature.state.lock();

        if state.level == HealthLevel::Full {
            state.level = HealthLevel::Degraded;
            state.demoted_at = Some(now);
            warn!(
                "Feature '{}' primary failed, level {} -> {}: {}",
                feature.name,
                HealthLevel::Full,
                HealthLevel::Degraded,
                error
            );
        } else {
            warn!("Feature '{}' primary failed: {}", feature.name, error);
        }
    }

    fn serve_default<T: Clone + 'static>(
        &self,
        feature: &Feature,
        level: Option<HealthLevel>,
    ) -> Result<T, DegradationError> {
        let value = match &feature.fallback_value {
            Some(value) => value,
            None => {
                warn!("Feature '{}' has no default value to serve", feature.name);
                return Err(DegradationError::FeatureUnavailable {
                    feature: feature.name.clone(),
                });
            }
        };

        let value = value
            .downcast_ref::<T>()
            .ok_or_else(|| DegradationError::FallbackTypeMismatch {
                feature: feature.name.clone(),
                expected: std::any::type_name::<T>(),
            })?;

        bump(&feature.counters.defaults_served);
        if let Some(level) = level {
            info!("Feature '{}' at level {}: serving default", feature.name, level);
        }
        Ok(value.clone())
    }
}
