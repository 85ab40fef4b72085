//! Structured logging setup.
//!
//! Thin wrapper over `tracing-subscriber`: an env-filtered fmt layer
//! with optional JSON output. The engine itself only ever emits through
//! `tracing` macros; logging never blocks the run loop and failures to
//! emit are ignored.

use tracing_subscriber::EnvFilter;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether logging is enabled.
    pub enabled: bool,
    /// Default level directive (e.g. "info", "iris_server=debug").
    pub level: String,
    /// Whether to output JSON format.
    pub json_format: bool,
    /// Whether to include the module path in events.
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            json_format: true,
            include_target: true,
        }
    }
}

impl LogConfig {
    /// Human-readable output at debug level, for development.
    pub fn development() -> Self {
        Self {
            enabled: true,
            level: "debug".to_string(),
            json_format: false,
            include_target: true,
        }
    }

    /// JSON output at info level, for production.
    pub fn production() -> Self {
        Self::default()
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level when set. Calling this
/// twice returns an error from the subscriber registry; the second call
/// is reported, not fatal.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    if !config.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| format!("invalid log filter: {e}"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| format!("unable to install subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.level, "info");
        assert!(config.json_format);
    }

    #[test]
    fn test_development_preset() {
        let config = LogConfig::development();
        assert_eq!(config.level, "debug");
        assert!(!config.json_format);
    }

    #[test]
    fn test_disabled_logging_is_a_noop() {
        let config = LogConfig {
            enabled: false,
            ..LogConfig::default()
        };
        assert!(init_logging(&config).is_ok());
    }
}
