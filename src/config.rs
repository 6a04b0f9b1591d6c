//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides; command
//! line flags are applied on top by the binaries.
//!
//! Precedence: defaults < config file < environment < command line.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{compile_origin_pattern, ApiConfig as ListenConfig, FacadeSettings};
use crate::query::{parse_duration, EngineOptions};

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "METRICS_VIEWER_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Dataset location
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the block files; usually given on the command line
    pub data_dir: Option<String>,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Regex an `Origin` header must fully match
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    14332
}

fn default_cors_origin() -> String {
    ".*".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
        }
    }
}

/// Query execution limits
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_timeout")]
    pub timeout: String,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_samples")]
    pub max_samples: u64,

    #[serde(default = "default_lookback_delta")]
    pub lookback_delta: String,

    #[serde(default = "default_max_points")]
    pub max_points_per_series: i64,
}

fn default_timeout() -> String {
    "2m".to_string()
}

fn default_max_concurrency() -> usize {
    20
}

fn default_max_samples() -> u64 {
    50_000_000
}

fn default_lookback_delta() -> String {
    "5m".to_string()
}

fn default_max_points() -> i64 {
    11_000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_concurrency: default_max_concurrency(),
            max_samples: default_max_samples(),
            lookback_delta: default_lookback_delta(),
            max_points_per_series: default_max_points(),
        }
    }
}

/// Shutdown behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long open requests and running queries get after the stop signal
    #[serde(default = "default_grace")]
    pub grace: String,
}

fn default_grace() -> String {
    "30s".to_string()
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace: default_grace(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Validated runtime settings derived from a [`Config`]
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub listen: ListenConfig,
    pub engine: EngineOptions,
    pub facade: FacadeSettings,
    pub max_concurrency: usize,
    pub shutdown_grace: Duration,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// File at the user's config directory, if one exists, else defaults
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = dirs::config_dir().map(|p| p.join("metrics-viewer").join("config.toml"));
        match path {
            Some(path) if path.exists() => {
                tracing::info!("Loaded config from {:?}", path);
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Apply `METRICS_VIEWER_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    /// Apply overrides from `lookup`, keyed without the prefix
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(data_dir) = lookup("DATA_DIR") {
            self.storage.data_dir = Some(data_dir);
        }

        // API overrides
        if let Some(host) = lookup("HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.api.port = parse_number("PORT", &port)?;
        }
        if let Some(origin) = lookup("CORS_ORIGIN") {
            self.api.cors_origin = origin;
        }

        // Query overrides
        if let Some(timeout) = lookup("QUERY_TIMEOUT") {
            self.query.timeout = timeout;
        }
        if let Some(max) = lookup("QUERY_MAX_CONCURRENCY") {
            self.query.max_concurrency = parse_number("QUERY_MAX_CONCURRENCY", &max)?;
        }
        if let Some(max) = lookup("QUERY_MAX_SAMPLES") {
            self.query.max_samples = parse_number("QUERY_MAX_SAMPLES", &max)?;
        }
        if let Some(lookback) = lookup("LOOKBACK_DELTA") {
            self.query.lookback_delta = lookback;
        }

        // Logging overrides
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Check every value and convert to runtime settings
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let data_dir = match self.storage.data_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => return Err(ConfigError::Invalid("no data directory given".into())),
        };

        if self.query.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "query.max_concurrency must be at least 1".into(),
            ));
        }
        if self.query.max_samples == 0 {
            return Err(ConfigError::Invalid(
                "query.max_samples must be at least 1".into(),
            ));
        }
        if self.query.max_points_per_series <= 0 {
            return Err(ConfigError::Invalid(
                "query.max_points_per_series must be positive".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be \"pretty\" or \"json\", got {:?}",
                self.logging.format
            )));
        }

        let cors_origin = compile_origin_pattern(&self.api.cors_origin).map_err(|e| {
            ConfigError::Invalid(format!("api.cors_origin is not a valid regex: {}", e))
        })?;

        Ok(Settings {
            data_dir,
            listen: ListenConfig::new(self.api.host.clone(), self.api.port),
            engine: EngineOptions {
                timeout: positive_duration("query.timeout", &self.query.timeout)?,
                max_samples: self.query.max_samples,
                lookback_delta: positive_duration(
                    "query.lookback_delta",
                    &self.query.lookback_delta,
                )?,
            },
            facade: FacadeSettings {
                cors_origin: Some(cors_origin),
                max_points_per_series: self.query.max_points_per_series,
            },
            max_concurrency: self.query.max_concurrency,
            shutdown_grace: positive_duration("shutdown.grace", &self.shutdown.grace)?,
            logging: self.logging.clone(),
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| {
        ConfigError::Invalid(format!("{}{}: invalid number {:?}", ENV_PREFIX, key, raw))
    })
}

fn positive_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let duration = parse_duration(raw.trim())
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", key, e)))?;
    if duration.is_zero() {
        return Err(ConfigError::Invalid(format!("{} must be positive", key)));
    }
    Ok(duration)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# metrics-viewer configuration
#
# Environment variables override these settings:
# - METRICS_VIEWER_DATA_DIR
# - METRICS_VIEWER_HOST
# - METRICS_VIEWER_PORT
# - METRICS_VIEWER_CORS_ORIGIN
# - METRICS_VIEWER_QUERY_TIMEOUT
# - METRICS_VIEWER_QUERY_MAX_CONCURRENCY
# - METRICS_VIEWER_QUERY_MAX_SAMPLES
# - METRICS_VIEWER_LOOKBACK_DELTA
# - METRICS_VIEWER_LOG_LEVEL
# - METRICS_VIEWER_LOG_FORMAT
#
# Command line flags override both.

[storage]
# Directory holding the *.mvb block files
# data_dir = "/var/lib/metrics-viewer"

[api]
# API server host
host = "0.0.0.0"

# API server port
port = 14332

# Regex an Origin header must fully match
cors_origin = ".*"

[query]
# Maximum time a query may take, waiting for a slot included
timeout = "2m"

# Queries evaluated at the same time
max_concurrency = 20

# Samples a single query may load
max_samples = 50000000

# How far back an instant selector looks for the latest sample
lookback_delta = "5m"

# Largest number of points a range query may return per series
max_points_per_series = 11000

[shutdown]
# Time open requests get to finish after a stop signal
grace = "30s"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_dir(mut config: Config) -> Config {
        config.storage.data_dir = Some("/data".into());
        config
    }

    #[test]
    fn test_defaults() {
        let settings = with_dir(Config::default()).validate().unwrap();

        assert_eq!(settings.listen.addr(), "0.0.0.0:14332");
        assert_eq!(settings.engine.timeout, Duration::from_secs(120));
        assert_eq!(settings.engine.lookback_delta, Duration::from_secs(300));
        assert_eq!(settings.engine.max_samples, 50_000_000);
        assert_eq!(settings.max_concurrency, 20);
        assert_eq!(settings.facade.max_points_per_series, 11_000);
        assert_eq!(settings.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_generated_config_parses() {
        let config = Config::parse(&generate_default_config()).unwrap();
        assert!(config.storage.data_dir.is_none());
        assert!(with_dir(config).validate().is_ok());
    }

    #[test]
    fn test_partial_file() {
        let config = Config::parse(
            r#"
            [query]
            timeout = "1m30s"
            max_concurrency = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.query.max_concurrency, 4);
        assert_eq!(config.api.port, 14332);
        let settings = with_dir(config).validate().unwrap();
        assert_eq!(settings.engine.timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("QUERY_MAX_SAMPLES", "1000"),
            ("LOOKBACK_DELTA", "1m"),
            ("DATA_DIR", "/srv/blocks"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        let settings = config.validate().unwrap();

        assert_eq!(settings.listen.port, 9000);
        assert_eq!(settings.engine.max_samples, 1000);
        assert_eq!(settings.engine.lookback_delta, Duration::from_secs(60));
        assert_eq!(settings.data_dir, PathBuf::from("/srv/blocks"));
    }

    #[test]
    fn test_invalid_env_number() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "PORT").then(|| "lots".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_errors() {
        assert!(Config::default().validate().is_err());

        let mut config = with_dir(Config::default());
        config.query.max_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = with_dir(Config::default());
        config.query.timeout = "0s".into();
        assert!(config.validate().is_err());

        let mut config = with_dir(Config::default());
        config.query.lookback_delta = "five minutes".into();
        assert!(config.validate().is_err());

        let mut config = with_dir(Config::default());
        config.api.cors_origin = "(".into();
        assert!(config.validate().is_err());

        let mut config = with_dir(Config::default());
        config.logging.format = "xml".into();
        assert!(config.validate().is_err());
    }
}
