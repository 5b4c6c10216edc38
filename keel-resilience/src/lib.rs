//! Resilience patterns for Keel
//!
//! This crate provides per-dependency resilience pipelines (bulkhead,
//! circuit breaker and retry, composed in that order) and a graceful
//! degradation manager that routes calls between primary, fallback and
//! default paths.

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod clock;
pub mod degradation;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod retry;

// Re-export commonly used types
pub use backoff::BackoffCalculator;
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit, BulkheadSnapshot, BulkheadStrategy};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitSnapshot,
    CircuitState,
};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use degradation::{
    health_check_fn, CircuitBreakerHealthCheck, DegradationError, DegradationManager,
    FeatureConfig, FeatureRegistration, FeatureStats, HealthCheck, HealthCheckError, HealthLevel,
};
pub use error::{ConfigError, ConfigResult, ErrorClassifier, ResilienceError, Retryable};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineConfig, PipelineStats, RejectionPolicy};
pub use registry::PipelineRegistry;
pub use retry::{RetryExecutor, RetryPolicy};

// Cancellation handle accepted by every async entry point
pub use tokio_util::sync::CancellationToken;
