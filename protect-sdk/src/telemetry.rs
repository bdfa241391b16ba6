use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtectError, Result};

/// Default directive when `RUST_LOG` is not set
pub fn default_directive(config: &LoggingConfig) -> String {
    format!("protect_sdk={level},analyze_host={level}", level = config.level)
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_directive(config).into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtectError::Configuration(format!("Failed to initialize tracing: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            json: false,
        };
        assert_eq!(default_directive(&config), "protect_sdk=debug,analyze_host=debug");
    }
}
