//! Configuration loading and environment variable handling

use crate::domains::KeelConfig;
use crate::error::{ConfigError, ConfigResult};
use keel_logging::{LogFormat, LogLevel, LoggingConfig};
use keel_resilience::{BulkheadConfig, PipelineConfig};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
///
/// Pipeline overrides use `<PREFIX>_PIPELINE_<NAME>_<SETTING>`, where
/// `<NAME>` is the pipeline name upper-cased with every non-alphanumeric
/// character replaced by `_`. Only pipelines present in the loaded
/// configuration can be overridden.
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "KEEL".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<KeelConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: KeelConfig = serde_yaml::from_str(&content)?;
        log::debug!("Loaded configuration from {}", path.display());

        // Apply environment variable overrides
        self.apply_env_overrides(&mut config)?;

        // Validate all domains
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<KeelConfig> {
        let mut config = KeelConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<KeelConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut KeelConfig) -> ConfigResult<()> {
        self.apply_logging_overrides(&mut config.logging)?;

        for (name, pipeline) in config.pipelines.iter_mut() {
            self.apply_pipeline_overrides(name, pipeline)?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level).map_err(|_| {
                ConfigError::EnvError(format!(
                    "Invalid {}: {}",
                    self.env_name("LOG_LEVEL"),
                    log_level
                ))
            })?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format).map_err(|_| {
                ConfigError::EnvError(format!("Invalid {}: {}", self.env_name("LOG_FORMAT"), format))
            })?;
        }

        if let Ok(filter) = self.get_env_var("LOG_FILTER") {
            config.filter = Some(filter);
        }

        Ok(())
    }

    /// Apply overrides for one named pipeline
    ///
    /// Setting a breaker or retry value enables that layer with defaults
    /// for everything not overridden.
    fn apply_pipeline_overrides(&self, name: &str, config: &mut PipelineConfig) -> ConfigResult<()> {
        let key = env_key(name);

        let var = format!("PIPELINE_{}_FAILURE_THRESHOLD", key);
        if let Ok(value) = self.get_env_var(&var) {
            let threshold = parse_number(&self.env_name(&var), &value)?;
            config
                .circuit_breaker
                .get_or_insert_with(Default::default)
                .failure_threshold = threshold;
        }

        let var = format!("PIPELINE_{}_OPEN_TIMEOUT", key);
        if let Ok(value) = self.get_env_var(&var) {
            let timeout = parse_duration(&self.env_name(&var), &value)?;
            config
                .circuit_breaker
                .get_or_insert_with(Default::default)
                .open_timeout = timeout;
        }

        let var = format!("PIPELINE_{}_RETRY_MAX_ATTEMPTS", key);
        if let Ok(value) = self.get_env_var(&var) {
            let attempts = parse_number(&self.env_name(&var), &value)?;
            config.retry.get_or_insert_with(Default::default).max_attempts = attempts;
        }

        let var = format!("PIPELINE_{}_BULKHEAD_CAPACITY", key);
        if let Ok(value) = self.get_env_var(&var) {
            let capacity = parse_number(&self.env_name(&var), &value)?;
            config
                .bulkhead
                .get_or_insert_with(BulkheadConfig::default)
                .capacity = capacity;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(self.env_name(name))
    }

    /// Full variable name as the user sets it
    fn env_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_number<T>(var: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", var, e)))
}

fn parse_duration(var: &str, value: &str) -> ConfigResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", var, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("payments"), "PAYMENTS");
        assert_eq!(env_key("user-profile.v2"), "USER_PROFILE_V2");
    }

    #[test]
    fn test_env_name_includes_prefix() {
        assert_eq!(
            ConfigLoader::new().env_name("PIPELINE_PAYMENTS_OPEN_TIMEOUT"),
            "KEEL_PIPELINE_PAYMENTS_OPEN_TIMEOUT"
        );
        assert_eq!(ConfigLoader::with_prefix("APP").env_name("LOG_LEVEL"), "APP_LOG_LEVEL");
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_number::<u32>("X", " 7 ").unwrap(), 7);
        assert!(parse_number::<u32>("X", "-1").is_err());
        assert_eq!(
            parse_duration("X", "1m 30s").unwrap(),
            Duration::from_secs(90)
        );
        assert!(matches!(
            parse_duration("X", "soon"),
            Err(ConfigError::EnvError(message)) if message.starts_with("Invalid X")
        ));
    }
}
