//! Resilience pipeline configuration

use crate::error::ConfigResult;
use crate::validation::{domain_error, Validatable};
use keel_resilience::{PipelineConfig, RejectionPolicy};

impl Validatable for PipelineConfig {
    fn validate(&self) -> ConfigResult<()> {
        PipelineConfig::validate(self).map_err(|e| domain_error(self.domain_name(), e))?;

        if self.rejection_policy == RejectionPolicy::CountAsFailure
            && (self.circuit_breaker.is_none() || self.bulkhead.is_none())
        {
            log::warn!(
                "rejection_policy count_as_failure has no effect without both a bulkhead and a circuit breaker"
            );
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "pipeline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use keel_resilience::{BulkheadConfig, RetryPolicy};

    #[test]
    fn test_default_pipeline_is_valid() {
        assert!(Validatable::validate(&PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_layer_errors_are_tagged_with_domain() {
        let config = PipelineConfig {
            retry: Some(RetryPolicy {
                multiplier: 1.0,
                ..RetryPolicy::default()
            }),
            ..PipelineConfig::default()
        };

        match Validatable::validate(&config) {
            Err(ConfigError::DomainError { domain, message }) => {
                assert_eq!(domain, "pipeline");
                assert!(message.contains("multiplier"), "{}", message);
            }
            other => panic!("expected domain error, got {:?}", other),
        }

        let config = PipelineConfig {
            bulkhead: Some(BulkheadConfig::fixed_pool(0)),
            ..PipelineConfig::default()
        };
        assert!(Validatable::validate(&config).is_err());
    }
}
