//! Degradable feature configuration

use crate::error::ConfigResult;
use crate::validation::{domain_error, Validatable};
use keel_resilience::FeatureConfig;

impl Validatable for FeatureConfig {
    fn validate(&self) -> ConfigResult<()> {
        FeatureConfig::validate(self).map_err(|e| domain_error(self.domain_name(), e))
    }

    fn domain_name(&self) -> &'static str {
        "feature"
    }
}
