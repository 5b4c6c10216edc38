use super::{LogFormat, LoggingConfig};
use anyhow::{Context, Result};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize logging from configuration
///
/// Records emitted through the `log` facade are forwarded to the same
/// subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let directives = config.directives();
    let env_filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("Invalid log filter directives '{}'", directives))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids);

    // Use try_init to avoid panic if global subscriber already set
    let result = match config.format {
        LogFormat::Json => registry.with(layer.json()).try_init(),
        LogFormat::Compact => registry.with(layer.compact()).try_init(),
        LogFormat::Pretty => registry.with(layer.pretty()).try_init(),
        LogFormat::Text => registry.with(layer).try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}
