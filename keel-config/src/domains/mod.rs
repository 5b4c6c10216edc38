//! Domain-specific configuration modules

pub mod feature;
pub mod logging;
pub mod pipeline;

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};
use keel_logging::LoggingConfig;
use keel_resilience::{
    FeatureConfig, FeatureRegistration, PipelineConfig, PipelineRegistry, Retryable,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Main Keel configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeelConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Resilience pipelines keyed by dependency name
    pub pipelines: BTreeMap<String, PipelineConfig>,

    /// Degradable features keyed by feature name
    pub features: BTreeMap<String, FeatureConfig>,
}

impl KeelConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.logging.validate()?;

        for (name, pipeline) in &self.pipelines {
            validate_required_string(name, "pipeline name", "pipelines")?;
            Validatable::validate(pipeline).map_err(|e| tag(e, "pipelines", name))?;
        }

        for (name, feature) in &self.features {
            validate_required_string(name, "feature name", "features")?;
            Validatable::validate(feature).map_err(|e| tag(e, "features", name))?;
        }

        Ok(())
    }

    /// Create a registry holding every configured pipeline
    pub fn build_registry<E: Retryable + 'static>(&self) -> ConfigResult<PipelineRegistry<E>> {
        let registry = PipelineRegistry::new();
        for (name, pipeline) in &self.pipelines {
            registry.get_or_create(name, pipeline)?;
        }
        Ok(registry)
    }

    /// Settings for a feature, defaults when it is not configured
    pub fn feature_config(&self, name: &str) -> FeatureConfig {
        self.features.get(name).cloned().unwrap_or_default()
    }

    /// Registration for a feature carrying its configured settings
    pub fn feature_registration(&self, name: &str) -> FeatureRegistration {
        FeatureRegistration::new(name).config(self.feature_config(name))
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let mut config = KeelConfig::default();
        config
            .pipelines
            .insert("example".to_string(), PipelineConfig::default());
        config
            .features
            .insert("example".to_string(), FeatureConfig::default());
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}

fn tag(error: crate::ConfigError, section: &str, name: &str) -> crate::ConfigError {
    match error {
        crate::ConfigError::DomainError { message, .. } => crate::ConfigError::DomainError {
            domain: format!("{}.{}", section, name),
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use keel_resilience::CircuitBreakerConfig;

    #[derive(Debug)]
    struct Transient;

    impl std::fmt::Display for Transient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "transient")
        }
    }

    impl Retryable for Transient {
        fn is_retryable(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_errors_name_the_offending_entry() {
        let mut config = KeelConfig::default();
        config.pipelines.insert(
            "payments".to_string(),
            PipelineConfig {
                circuit_breaker: Some(CircuitBreakerConfig {
                    success_threshold: 0,
                    ..CircuitBreakerConfig::default()
                }),
                ..PipelineConfig::default()
            },
        );

        match config.validate_all() {
            Err(ConfigError::DomainError { domain, .. }) => assert_eq!(domain, "pipelines.payments"),
            other => panic!("expected domain error, got {:?}", other),
        }
    }

    #[test]
    fn test_build_registry() {
        let mut config = KeelConfig::default();
        config
            .pipelines
            .insert("orders".to_string(), PipelineConfig::default());
        config
            .pipelines
            .insert("search".to_string(), PipelineConfig::default());

        let registry = config.build_registry::<Transient>().unwrap();
        assert_eq!(registry.names(), vec!["orders".to_string(), "search".to_string()]);
    }

    #[test]
    fn test_unknown_feature_gets_defaults() {
        let config = KeelConfig::default();
        assert_eq!(config.feature_config("anything"), FeatureConfig::default());
    }

    #[test]
    fn test_generate_sample_config() {
        let sample = KeelConfig::generate_sample();
        assert!(sample.contains("logging:"));
        assert!(sample.contains("pipelines:"));
        assert!(sample.contains("features:"));

        let parsed: KeelConfig = serde_yaml::from_str(&sample).unwrap();
        assert!(parsed.validate_all().is_ok());
    }
}
