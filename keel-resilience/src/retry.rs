//! Retry policy and executor

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffCalculator;
use crate::error::{ConfigError, ConfigResult, ErrorClassifier, ResilienceError, Retryable};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor applied per retry
    pub multiplier: f64,

    /// Fraction of the delay used as symmetric random jitter
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a conservative retry policy for critical operations
    pub fn conservative() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 1.5,
            jitter_fraction: 0.2,
        }
    }

    /// Create an aggressive retry policy for fast operations
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 1.2,
            jitter_fraction: 0.1,
        }
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.calculator().base_delay_for_retry(retry)
    }

    /// Check ranges; called before any executor is built
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts < 1 {
            return Err(ConfigError::invalid("retry", "max_attempts must be at least 1"));
        }
        if self.multiplier <= 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::invalid(
                "retry",
                format!("multiplier must be greater than 1, got {}", self.multiplier),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::invalid(
                "retry",
                format!("jitter_fraction must be in [0, 1), got {}", self.jitter_fraction),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                "retry",
                "max_delay must not be smaller than base_delay",
            ));
        }
        Ok(())
    }

    fn calculator(&self) -> BackoffCalculator {
        BackoffCalculator::new(
            self.base_delay,
            self.max_delay,
            self.multiplier,
            self.jitter_fraction,
        )
    }
}

/// Retry executor
pub struct RetryExecutor<E> {
    policy: RetryPolicy,
    calculator: BackoffCalculator,
    classifier: ErrorClassifier<E>,
    retries: Arc<AtomicU64>,
}

impl<E: Retryable + 'static> RetryExecutor<E> {
    /// Create an executor that retries errors reporting [`Retryable::is_retryable`]
    pub fn new(policy: RetryPolicy) -> ConfigResult<Self> {
        Self::with_classifier(policy, ErrorClassifier::default())
    }
}

impl<E> RetryExecutor<E> {
    /// Create an executor with an explicit retryable predicate
    pub fn with_classifier(policy: RetryPolicy, classifier: ErrorClassifier<E>) -> ConfigResult<Self> {
        policy.validate()?;
        Ok(Self {
            calculator: policy.calculator(),
            policy,
            classifier,
            retries: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The policy this executor applies
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Total retries scheduled since creation
    pub fn retries_total(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with_context(cancel, |_attempt| f()).await
    }

    /// Execute a function with retry logic and the 1-based attempt number
    pub async fn execute_with_context<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let mut attempt = 1;

        loop {
            debug!(
                "Executing attempt {} of {}",
                attempt, self.policy.max_attempts
            );

            match f(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.classifier.classify(&error) {
                        warn!("Operation failed with non-retryable error: {}", error);
                        return Err(ResilienceError::Operation(error));
                    }

                    if attempt >= self.policy.max_attempts {
                        warn!("Operation failed after {} attempts: {}", attempt, error);
                        return Err(ResilienceError::RetryExhausted {
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let delay = self.calculator.delay_for_retry(attempt);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}",
                        attempt, error, delay
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!("Retry cancelled after {} attempts", attempt);
                            return Err(ResilienceError::Cancelled);
                        }
                        _ = sleep(delay) => {}
                    }

                    attempt += 1;
                }
            }
        }
    }
}
