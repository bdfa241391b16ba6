use std::path::PathBuf;
use std::time::Duration;

use analyze_host::AnalyzeConfig;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{ProtectError, Result};

/// Default decision service endpoint
pub const DEFAULT_BASE_URL: &str = "https://decide.protect.local";

/// Main configuration for a protector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectConfig {
    /// API key sent to the decision service
    pub key: String,
    /// Decision service base URL
    pub base_url: String,
    /// Deployment environment (development, staging, production)
    pub environment: String,
    /// Per remote call timeout in milliseconds; derived from `environment`
    /// when unset
    pub timeout_ms: Option<u64>,
    /// Treat rule errors as ALLOW (true) or DENY (false)
    pub fail_open: bool,
    /// Skip remaining rules after the first LIVE deny
    pub short_circuit: bool,
    /// Headers folded into the request fingerprint
    pub fingerprint_headers: Vec<String>,
    /// Trusted reverse proxy addresses or CIDR ranges
    pub proxies: Vec<String>,
    /// Take the client IP from `RequestContext::ip_src` on every call instead
    /// of resolving it from the socket peer and `proxies`
    pub disable_automatic_ip_detection: bool,
    /// Decision cache
    pub cache: CacheConfig,
    /// Analysis component
    pub analyze: AnalyzeSettings,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Decision cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of cached decisions
    pub max_entries: usize,
    /// Background sweep of expired entries; lazy eviction only when unset
    pub sweep_interval_seconds: Option<u64>,
}

/// Analysis component location and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzeSettings {
    /// Path to the compiled component (.wasm)
    pub component_path: Option<PathBuf>,
    pub max_fuel: u64,
    pub max_memory_bytes: usize,
    pub cache_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ProtectConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            environment: "production".to_string(),
            timeout_ms: None,
            fail_open: true,
            short_circuit: false,
            fingerprint_headers: vec!["user-agent".to_string()],
            proxies: Vec::new(),
            disable_automatic_ip_detection: false,
            cache: CacheConfig::default(),
            analyze: AnalyzeSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            sweep_interval_seconds: None,
        }
    }
}

impl Default for AnalyzeSettings {
    fn default() -> Self {
        let limits = AnalyzeConfig::default();
        Self {
            component_path: None,
            max_fuel: limits.max_fuel,
            max_memory_bytes: limits.max_memory_bytes,
            cache_enabled: limits.cache_enabled,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AnalyzeSettings {
    /// Limits handed to the component bridge
    pub fn limits(&self) -> AnalyzeConfig {
        AnalyzeConfig {
            max_fuel: self.max_fuel,
            max_memory_bytes: self.max_memory_bytes,
            cache_enabled: self.cache_enabled,
        }
    }
}

impl ProtectConfig {
    /// Create a configuration for `key` with defaults everywhere else
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file, with `PROTECT_*` environment overrides
    ///
    /// Nested fields use a double underscore, e.g. `PROTECT_CACHE__ENABLED`.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("PROTECT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Serialize the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Timeout applied to each remote call
    pub fn timeout(&self) -> Duration {
        let ms = self
            .timeout_ms
            .unwrap_or(if self.is_development() { 1000 } else { 500 });
        Duration::from_millis(ms)
    }

    /// Parse `proxies` into networks; bare addresses become host routes
    pub fn trusted_proxies(&self) -> Result<Vec<IpNet>> {
        self.proxies
            .iter()
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<std::net::IpAddr>().map(IpNet::from))
                    .map_err(|_| ProtectError::Configuration(format!("Invalid proxy address or CIDR: {}", entry)))
            })
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(ProtectError::Configuration("key must not be empty".to_string()));
        }

        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ProtectError::Configuration(format!("Invalid base_url {:?}: {}", self.base_url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ProtectError::Configuration(format!(
                "base_url must use http or https, got {}",
                url.scheme()
            )));
        }

        if self.timeout_ms == Some(0) {
            return Err(ProtectError::Configuration("timeout_ms must be greater than 0".to_string()));
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ProtectError::Configuration(
                "cache.max_entries must be greater than 0 when the cache is enabled".to_string(),
            ));
        }

        if self.cache.sweep_interval_seconds == Some(0) {
            return Err(ProtectError::Configuration(
                "cache.sweep_interval_seconds must be greater than 0".to_string(),
            ));
        }

        self.trusted_proxies()?;
        if self.disable_automatic_ip_detection && !self.proxies.is_empty() {
            return Err(ProtectError::Configuration(
                "proxies cannot be used when disable_automatic_ip_detection is set; they would have no effect"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProtectConfig::default();
        assert!(config.fail_open);
        assert!(!config.short_circuit);
        assert!(config.cache.enabled);
        assert_eq!(config.fingerprint_headers, vec!["user-agent".to_string()]);
        assert_eq!(config.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_development_timeout() {
        let config = ProtectConfig {
            environment: "development".to_string(),
            ..ProtectConfig::new("key")
        };
        assert_eq!(config.timeout(), Duration::from_millis(1000));

        let config = ProtectConfig {
            timeout_ms: Some(250),
            ..config
        };
        assert_eq!(config.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation() {
        assert!(ProtectConfig::new("ajkey_test").validate().is_ok());
        assert!(ProtectConfig::default().validate().is_err());

        let config = ProtectConfig {
            base_url: "not a url".to_string(),
            ..ProtectConfig::new("k")
        };
        assert!(config.validate().is_err());

        let config = ProtectConfig {
            timeout_ms: Some(0),
            ..ProtectConfig::new("k")
        };
        assert!(config.validate().is_err());

        let mut config = ProtectConfig::new("k");
        config.cache.max_entries = 0;
        assert!(config.validate().is_err());

        let config = ProtectConfig {
            proxies: vec!["10.0.0.0/8".to_string(), "not-an-ip".to_string()],
            ..ProtectConfig::new("k")
        };
        assert!(matches!(config.validate(), Err(ProtectError::Configuration(_))));
    }

    #[test]
    fn test_manual_ip_detection_rejects_proxies() {
        let config = ProtectConfig {
            disable_automatic_ip_detection: true,
            ..ProtectConfig::new("k")
        };
        assert!(config.validate().is_ok());

        let config = ProtectConfig {
            proxies: vec!["10.0.0.0/8".to_string()],
            ..config
        };
        match config.validate() {
            Err(ProtectError::Configuration(msg)) => assert!(msg.contains("proxies")),
            other => panic!("expected a configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_trusted_proxies() {
        let config = ProtectConfig {
            proxies: vec!["10.0.0.0/8".to_string(), "192.168.1.1".to_string()],
            ..ProtectConfig::new("k")
        };
        let nets = config.trusted_proxies().unwrap();
        assert_eq!(nets.len(), 2);
        assert!(nets[1].contains(&"192.168.1.1".parse::<std::net::IpAddr>().unwrap()));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ProtectConfig::new("ajkey_test");
        let toml_string = config.to_toml().unwrap();
        assert!(toml_string.contains("ajkey_test"));

        let parsed: ProtectConfig = toml::from_str(&toml_string).unwrap();
        assert_eq!(parsed.key, "ajkey_test");
        assert_eq!(parsed.cache.max_entries, config.cache.max_entries);
    }
}
