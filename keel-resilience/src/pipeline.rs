//! Per-dependency resilience pipeline
//!
//! A pipeline composes the configured layers in a fixed order:
//! bulkhead (admission control), circuit breaker (fail-fast gate), retry
//! (transient-failure absorption), then the work itself. Rejections happen
//! before the retry layer is reached, so they are never retried.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bulkhead::{Bulkhead, BulkheadConfig, BulkheadSnapshot};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::clock::{system_clock, SharedClock};
use crate::error::{ConfigResult, ErrorClassifier, ResilienceError, Retryable};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Whether bulkhead rejections feed the circuit breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Rejections leave breaker accounting untouched
    #[default]
    Independent,
    /// Every bulkhead rejection is recorded as a breaker failure
    CountAsFailure,
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Circuit breaker layer, `None` to disable
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Retry layer, `None` to disable
    pub retry: Option<RetryPolicy>,

    /// Bulkhead layer, `None` to disable
    pub bulkhead: Option<BulkheadConfig>,

    /// How bulkhead rejections interact with the breaker
    pub rejection_policy: RejectionPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            retry: Some(RetryPolicy::default()),
            bulkhead: None,
            rejection_policy: RejectionPolicy::Independent,
        }
    }
}

impl PipelineConfig {
    /// Check every configured layer
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.validate()?;
        }
        Ok(())
    }
}

/// Read-only pipeline snapshot
///
/// Counters are cumulative and monotonic for the life of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub name: String,
    pub circuit: Option<CircuitSnapshot>,
    pub bulkhead: Option<BulkheadSnapshot>,
    pub calls_total: u64,
    pub successes_total: u64,
    pub failures_total: u64,
    pub circuit_rejections_total: u64,
    pub bulkhead_rejections_total: u64,
    pub cancellations_total: u64,
    pub retries_total: u64,
}

impl PipelineStats {
    /// Calls currently inside the bulkhead, zero without one
    pub fn in_flight(&self) -> usize {
        self.bulkhead.as_ref().map(|b| b.in_flight).unwrap_or(0)
    }
}

#[derive(Default)]
struct PipelineCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    circuit_rejections: AtomicU64,
    bulkhead_rejections: AtomicU64,
    cancellations: AtomicU64,
}

struct PipelineInner<E> {
    name: String,
    config: PipelineConfig,
    breaker: Option<CircuitBreaker>,
    bulkhead: Option<Bulkhead>,
    retry: Option<RetryExecutor<E>>,
    failure_classifier: ErrorClassifier<E>,
    counters: PipelineCounters,
}

/// Resilience pipeline for one logical dependency
///
/// Cloning is cheap and clones share state. Two pipelines built separately
/// never share state, even under the same name; use
/// [`crate::registry::PipelineRegistry`] for one pipeline per name.
pub struct Pipeline<E> {
    inner: Arc<PipelineInner<E>>,
}

impl<E> Clone for Pipeline<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for Pipeline<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<E: Retryable + 'static> Pipeline<E> {
    /// Create a pipeline using [`Retryable`] for both classifiers
    pub fn new(name: impl Into<String>, config: PipelineConfig) -> ConfigResult<Self> {
        PipelineBuilder::new(name).config(config).build()
    }

    /// Start a builder using [`Retryable`] as the default classifier
    pub fn builder(name: impl Into<String>) -> PipelineBuilder<E> {
        PipelineBuilder::new(name)
    }
}

impl<E> Pipeline<E> {
    /// Pipeline name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// The circuit breaker layer, if configured
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.inner.breaker.as_ref()
    }

    /// The bulkhead layer, if configured
    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.inner.bulkhead.as_ref()
    }

    /// Run `f` through every configured layer
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let inner = &self.inner;
        inner.counters.calls.fetch_add(1, Ordering::Relaxed);

        let result = match &inner.bulkhead {
            Some(bulkhead) => bulkhead.call(|| self.guarded(cancel, f)).await,
            None => self.guarded(cancel, f).await,
        };

        self.record(&result);
        result
    }

    /// Run owned work through every configured layer on the bulkhead's workers
    ///
    /// With a `FixedPool` bulkhead the breaker and retry layers run together
    /// with the work on the pool's dedicated threads. Without one this is the
    /// same as [`Pipeline::execute`].
    pub async fn dispatch<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + Sync + 'static,
    {
        let inner = &self.inner;
        inner.counters.calls.fetch_add(1, Ordering::Relaxed);

        let result = match &inner.bulkhead {
            Some(bulkhead) => {
                let pipeline = self.clone();
                let cancel = cancel.clone();
                bulkhead
                    .dispatch(move || async move { pipeline.guarded(&cancel, f).await })
                    .await
            }
            None => self.guarded(cancel, f).await,
        };

        self.record(&result);
        result
    }

    /// Snapshot of every layer plus pipeline counters
    pub fn stats(&self) -> PipelineStats {
        let inner = &self.inner;
        let counters = &inner.counters;

        PipelineStats {
            name: inner.name.clone(),
            circuit: inner.breaker.as_ref().map(CircuitBreaker::snapshot),
            bulkhead: inner.bulkhead.as_ref().map(Bulkhead::snapshot),
            calls_total: counters.calls.load(Ordering::Relaxed),
            successes_total: counters.successes.load(Ordering::Relaxed),
            failures_total: counters.failures.load(Ordering::Relaxed),
            circuit_rejections_total: counters.circuit_rejections.load(Ordering::Relaxed),
            bulkhead_rejections_total: counters.bulkhead_rejections.load(Ordering::Relaxed),
            cancellations_total: counters.cancellations.load(Ordering::Relaxed),
            retries_total: inner
                .retry
                .as_ref()
                .map(RetryExecutor::retries_total)
                .unwrap_or(0),
        }
    }

    async fn guarded<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let inner = &self.inner;
        // Panics are contained below the breaker so it sees them as failures
        let containment = inner.bulkhead.as_ref().filter(|b| b.contains_panics());

        match (&inner.breaker, containment) {
            (Some(breaker), Some(bulkhead)) => {
                breaker
                    .call(&inner.failure_classifier, || {
                        bulkhead.contain(self.attempts(cancel, f))
                    })
                    .await
            }
            (Some(breaker), None) => {
                breaker
                    .call(&inner.failure_classifier, || self.attempts(cancel, f))
                    .await
            }
            (None, _) => self.attempts(cancel, f).await,
        }
    }

    async fn attempts<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        match &self.inner.retry {
            Some(retry) => retry.execute(cancel, f).await,
            None if cancel.is_cancelled() => Err(ResilienceError::Cancelled),
            None => f().await.map_err(ResilienceError::Operation),
        }
    }

    fn record<T>(&self, result: &Result<T, ResilienceError<E>>) {
        let inner = &self.inner;
        let counters = &inner.counters;

        match result {
            Ok(_) => {
                counters.successes.fetch_add(1, Ordering::Relaxed);
            }
            Err(ResilienceError::CircuitOpen { .. }) => {
                counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
            }
            Err(ResilienceError::BulkheadRejected { .. }) => {
                counters.bulkhead_rejections.fetch_add(1, Ordering::Relaxed);
                if inner.config.rejection_policy == RejectionPolicy::CountAsFailure {
                    if let Some(breaker) = &inner.breaker {
                        debug!(
                            "Pipeline '{}' counting bulkhead rejection as breaker failure",
                            inner.name
                        );
                        breaker.record_external_failure();
                    }
                }
            }
            Err(ResilienceError::Cancelled) => {
                counters.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Builder for pipelines with custom classifiers or clock
pub struct PipelineBuilder<E> {
    name: String,
    config: PipelineConfig,
    retryable: ErrorClassifier<E>,
    failure: Option<ErrorClassifier<E>>,
    clock: SharedClock,
}

impl<E: Retryable + 'static> PipelineBuilder<E> {
    /// Create a builder with default config and [`Retryable`] classification
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_classifier(name, ErrorClassifier::default())
    }
}

impl<E> PipelineBuilder<E> {
    /// Create a builder for error types that do not implement [`Retryable`]
    pub fn with_classifier(name: impl Into<String>, retryable: ErrorClassifier<E>) -> Self {
        Self {
            name: name.into(),
            config: PipelineConfig::default(),
            retryable,
            failure: None,
            clock: system_clock(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Configure or disable the circuit breaker layer
    pub fn circuit_breaker(mut self, config: Option<CircuitBreakerConfig>) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Configure or disable the retry layer
    pub fn retry(mut self, policy: Option<RetryPolicy>) -> Self {
        self.config.retry = policy;
        self
    }

    /// Configure or disable the bulkhead layer
    pub fn bulkhead(mut self, config: Option<BulkheadConfig>) -> Self {
        self.config.bulkhead = config;
        self
    }

    /// Set how bulkhead rejections feed the breaker
    pub fn rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.config.rejection_policy = policy;
        self
    }

    /// Predicate deciding which work errors are retried
    pub fn retryable_classifier(mut self, classifier: ErrorClassifier<E>) -> Self {
        self.retryable = classifier;
        self
    }

    /// Predicate deciding which work errors count as breaker failures
    ///
    /// Defaults to the retryable classifier.
    pub fn failure_classifier(mut self, classifier: ErrorClassifier<E>) -> Self {
        self.failure = Some(classifier);
        self
    }

    /// Use a custom clock for the breaker and rate windows
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and build
    pub fn build(self) -> ConfigResult<Pipeline<E>> {
        self.config.validate()?;

        let breaker = match &self.config.circuit_breaker {
            Some(config) => Some(CircuitBreaker::with_clock(
                self.name.clone(),
                config.clone(),
                self.clock.clone(),
            )?),
            None => None,
        };
        let bulkhead = match &self.config.bulkhead {
            Some(config) => Some(Bulkhead::with_clock(
                self.name.clone(),
                config.clone(),
                self.clock.clone(),
            )?),
            None => None,
        };
        let retry = match &self.config.retry {
            Some(policy) => Some(RetryExecutor::with_classifier(
                policy.clone(),
                self.retryable.clone(),
            )?),
            None => None,
        };
        let failure_classifier = self.failure.unwrap_or(self.retryable);

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                name: self.name,
                config: self.config,
                breaker,
                bulkhead,
                retry,
                failure_classifier,
                counters: PipelineCounters::default(),
            }),
        })
    }
}
