//! Error types shared by every resilience layer

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a protected call
///
/// Every layer returns this type so a composed pipeline yields one error
/// enum whose variants identify the layer that refused or failed the call.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The circuit breaker for this dependency is open
    #[error("Circuit breaker for '{dependency}' is open (last transition {since_transition:?} ago)")]
    CircuitOpen {
        dependency: String,
        since_transition: Duration,
    },

    /// The bulkhead had no capacity left
    #[error("Bulkhead '{pool}' rejected the call (capacity {capacity})")]
    BulkheadRejected { pool: String, capacity: usize },

    /// Every retryable attempt failed
    #[error("Retry exhausted after {attempts} attempts. Last error: {last_error}")]
    RetryExhausted { attempts: u32, last_error: E },

    /// The caller cancelled the call
    #[error("Call was cancelled")]
    Cancelled,

    /// The work panicked inside an isolated pool slot
    #[error("Call panicked inside bulkhead pool '{pool}'")]
    Panicked { pool: String },

    /// The work itself failed
    #[error("{0}")]
    Operation(E),
}

impl<E> ResilienceError<E> {
    /// Whether a layer refused the call before the work ran
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen { .. } | ResilienceError::BulkheadRejected { .. }
        )
    }

    /// Check if this represents an open circuit
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }

    /// Check if this represents a bulkhead rejection
    pub fn is_bulkhead_rejected(&self) -> bool {
        matches!(self, ResilienceError::BulkheadRejected { .. })
    }

    /// Borrow the error produced by the work, if any
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            ResilienceError::Operation(error) => Some(error),
            ResilienceError::RetryExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }

    /// Get the underlying work error if present
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Operation(error) => Some(error),
            ResilienceError::RetryExhausted { last_error, .. } => Some(last_error),
            _ => None,
        }
    }
}

/// Trait for errors that can be retried
pub trait Retryable {
    /// Whether this error is retryable
    fn is_retryable(&self) -> bool;
}

impl<E: Retryable> Retryable for ResilienceError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::Operation(error) => error.is_retryable(),
            // Rejections and exhausted inner retries must never feed an outer retry loop
            _ => false,
        }
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::TimedOut
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::NotConnected
                | ErrorKind::BrokenPipe
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::UnexpectedEof
        )
    }
}

type ClassifyFn<E> = dyn Fn(&E) -> bool + Send + Sync;

/// Predicate deciding whether an error belongs to a class
///
/// Used both as the retryable predicate of a retry executor and as the
/// failure predicate of a circuit breaker.
pub struct ErrorClassifier<E> {
    predicate: Arc<ClassifyFn<E>>,
}

impl<E> ErrorClassifier<E> {
    /// Wrap a predicate
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Classifier that matches every error
    pub fn always() -> Self {
        Self::new(|_| true)
    }

    /// Classifier that matches no error
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    /// Apply the predicate
    pub fn classify(&self, error: &E) -> bool {
        (self.predicate)(error)
    }
}

impl<E: 'static> ErrorClassifier<ResilienceError<E>> {
    /// Lift a classifier over work errors to one over layered results
    ///
    /// Rejections, cancellation and exhausted retries never match, so an
    /// outer retry loop around a breaker stops at the first open circuit.
    pub fn layered(inner: ErrorClassifier<E>) -> Self {
        Self::new(move |error| match error {
            ResilienceError::Operation(e) => inner.classify(e),
            _ => false,
        })
    }
}

impl<E: Retryable + 'static> Default for ErrorClassifier<E> {
    fn default() -> Self {
        Self::new(|error: &E| error.is_retryable())
    }
}

impl<E> Clone for ErrorClassifier<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<E> std::fmt::Debug for ErrorClassifier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier").finish_non_exhaustive()
    }
}

/// Result type for configuration and registry operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Invalid configuration or registry misuse
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A configuration value is out of range
    #[error("Invalid {component} configuration: {message}")]
    InvalidConfiguration { component: String, message: String },

    /// The registry was shut down
    #[error("Pipeline registry has been shut down")]
    RegistryClosed,
}

impl ConfigError {
    pub(crate) fn invalid(component: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidConfiguration {
            component: component.to_string(),
            message: message.into(),
        }
    }
}
