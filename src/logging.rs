//! Tracing initialization
//!
//! `RUST_LOG` wins over the configured level when it is set, so
//! `RUST_LOG=frh_daq::instrument=trace` works without touching the config.

use crate::config::FrhConfig;
use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Build the filter for `level`, deferring to `RUST_LOG` when present.
pub fn env_filter(level: &str) -> AppResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| DaqError::Configuration(format!("Invalid log level '{}': {}", level, e))),
    }
}

/// Install the global fmt subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init(level: &str) -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level)?)
        .with_target(true)
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("Failed to initialize tracing: {}", e)))
}

/// [`init`] with `application.log_level`.
pub fn init_from_config(config: &FrhConfig) -> AppResult<()> {
    init(&config.application.log_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_configured_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(env_filter(level).is_ok());
        }
    }
}
