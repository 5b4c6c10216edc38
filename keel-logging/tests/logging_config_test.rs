use keel_logging::{init_logging, init_simple_tracing, LogFormat, LogLevel, LoggingConfig};

#[test]
fn test_logging_config_integration() {
    let yaml_config = r#"
level: debug
format: json
with_thread_ids: true
filter: "keel_resilience=trace"
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();

    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);
    assert!(config.with_target);
    assert!(config.with_thread_ids);
    assert_eq!(config.directives(), "debug,keel_resilience=trace");

    init_logging(&config).unwrap();
    log::info!("log facade records reach the subscriber");

    // Second initialization is a no-op
    init_logging(&config).unwrap();
    init_simple_tracing("warn").unwrap();
}

#[test]
fn test_minimal_logging_config() {
    let config: LoggingConfig = serde_yaml::from_str("{}").unwrap();

    assert_eq!(config, LoggingConfig::default());
    assert_eq!(config.level, LogLevel::Info);
    assert_eq!(config.format, LogFormat::Text);
    assert!(config.filter.is_none());
}

#[test]
fn test_invalid_filter_is_reported() {
    let config = LoggingConfig {
        filter: Some("keel_resilience=[".to_string()),
        ..LoggingConfig::default()
    };

    assert!(init_logging(&config).is_err());
}

#[test]
fn test_unknown_level_rejected_in_yaml() {
    let result: Result<LoggingConfig, _> = serde_yaml::from_str("level: chatty");
    assert!(result.is_err());
}
