//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` takes precedence over
//! the configured level so operators can raise verbosity without touching the
//! config file.

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::{EdgeError, EdgeResult};
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter from `RUST_LOG`, else the configured level
pub fn env_filter(config: &LoggingConfig) -> EdgeResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| EdgeError::config(format!("Invalid logging.level '{}': {}", config.level, e))),
    }
}

/// Initialize the tracing subscriber. A second call is a no-op.
pub fn init_logging(config: &LoggingConfig) -> EdgeResult<()> {
    let filter = env_filter(config)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    Ok(())
}
