//! Configuration management for the rate limiter.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::Rate;

/// Prefix of environment variables overriding file configuration.
pub const ENV_PREFIX: &str = "SLIDING_LIMITER";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named rate limiting rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Where slot counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend holding the counters
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix of every shared-store key
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            prefix: default_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_prefix() -> String {
    "rate-limit".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A named rate limiting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name
    pub name: String,
    /// Rate literal, e.g. `"10 requests in 1 minute"`
    pub rate: Rate,
}

impl LimiterConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `SLIDING_LIMITER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder =
            builder.add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: LimiterConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check for duplicate rule names.
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(LimiterError::Config(format!(
                    "rule '{}' is defined more than once",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::TimeUnit;

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::from_yaml("{}").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.store.prefix, "rate-limit");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  backend: redis
  redis_url: redis://cache:6379/2
  prefix: rl
logging:
  level: debug
  format: json
rules:
  - name: login
    rate: "10 requests in 1 minute"
  - name: signup
    rate: "3 requests in 1 hour"
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.prefix, "rl");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].rate, Rate::new(10.0, 1.0, TimeUnit::Minutes));
        assert_eq!(config.rules[1].rate.period_in_seconds(), 3600.0);
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let yaml = r#"
rules:
  - name: broken
    rate: "lots of requests"
"#;
        assert!(LimiterConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let yaml = r#"
rules:
  - name: login
    rate: "10 requests in 1 minute"
  - name: login
    rate: "5 requests in 1 minute"
"#;
        let config = LimiterConfig::from_yaml(yaml).unwrap();
        assert!(matches!(config.validate(), Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "sliding-limiter-config-{}.yaml",
            std::process::id()
        ));
        let yaml = r#"
store:
  prefix: from-file
rules:
  - name: api
    rate: "100 requests in 1 second"
"#;
        std::fs::write(&path, yaml).unwrap();

        let config = LimiterConfig::load(Some(path.as_path())).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.prefix, "from-file");
        assert_eq!(config.rules[0].name, "api");
        assert_eq!(config.rules[0].rate.requests, 100.0);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = LimiterConfig::load(Some(Path::new("/nonexistent/sliding-limiter.yaml")));
        assert!(matches!(result, Err(LimiterError::ConfigLoad(_))));
    }
}
