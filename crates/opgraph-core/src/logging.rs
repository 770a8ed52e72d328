//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{CoreError, CoreResult};

/// Install a global fmt subscriber built from `config`.
///
/// `RUST_LOG` takes precedence over `config.level` when set. Returns `Ok(false)`
/// when a global subscriber was already installed (the existing one is kept),
/// so calling this from several tests or entry points is harmless.
///
/// # Errors
///
/// `CoreError::ConfigError` if the level directive does not parse.
pub fn init_logging(config: &LoggingConfig) -> CoreResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            CoreError::ConfigError(format!("Invalid log level '{}': {}", config.level, e))
        })?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format.as_str() {
        "compact" => builder.compact().try_init().is_ok(),
        "full" => builder.try_init().is_ok(),
        _ => builder.pretty().try_init().is_ok(),
    };

    if installed {
        tracing::debug!(level = %config.level, format = %config.format, "logging initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_keeps_first() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "compact".to_string(),
        };
        // Another test may have installed the subscriber first; either way
        // the second call never replaces it.
        init_logging(&config).unwrap();
        assert!(!init_logging(&config).unwrap());
    }
}
