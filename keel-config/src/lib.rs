//! Configuration management for Keel
//!
//! Loads logging settings, named resilience pipelines and degradable
//! features from YAML, applies environment variable overrides and
//! validates every domain before handing the configuration out.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::KeelConfig;
pub use keel_logging::{LogFormat, LogLevel, LoggingConfig};
pub use keel_resilience::{FeatureConfig, PipelineConfig};
