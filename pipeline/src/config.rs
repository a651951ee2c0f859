//! Pipeline configuration.
//!
//! Settings come from three layers, later ones winning:
//!
//! - built-in defaults
//! - an optional TOML file, named by `ROWFLOW_CONFIG` or passed explicitly
//! - environment overrides (`DATABASE_URL`, `ROWFLOW_KEY_PREFIX`,
//!   `ROWFLOW_METRICS_ADDR`)
//!
//! Every section validates itself; [`PipelineConfig::load`] refuses to return
//! a configuration that does not pass [`PipelineConfig::validate`].
//!
//! # Example
//!
//! ```no_run
//! use rowflow_pipeline::config::PipelineConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::from_env()?;
//!
//! println!("Key prefix: {}", config.launcher.key_prefix);
//! println!("Transform attempts: {}", config.stages.transform.max_attempts);
//! # Ok(())
//! # }
//! ```
//!
//! A file only needs the sections it changes:
//!
//! ```toml
//! [launcher]
//! key_prefix = "incoming/"
//!
//! [transform]
//! schema = "real_estate"
//!
//! [stages.load]
//! max_attempts = 5
//! max_concurrency = 4
//! ```

use rowflow_core::pattern::EventPattern;
use rowflow_runtime::{RetryPolicy, RouterConfig};
use rowflow_workers::{IngestionConfig, LauncherConfig, NormalizationSchema};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Names the TOML file read by [`PipelineConfig::from_env`].
pub const CONFIG_PATH_VAR: &str = "ROWFLOW_CONFIG";
/// Connection string of the durable stores.
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
/// Overrides [`LauncherConfig::key_prefix`].
pub const KEY_PREFIX_VAR: &str = "ROWFLOW_KEY_PREFIX";
/// Overrides [`MetricsConfig::listen_addr`].
pub const METRICS_ADDR_VAR: &str = "ROWFLOW_METRICS_ADDR";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        /// File that was requested
        path: PathBuf,
        /// I/O failure
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`PipelineConfig`]
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override holds an unusable value
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// A setting is out of range
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Which normalization the transform stage applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaChoice {
    /// Normalize keys and values only; `id` comes from the `id` column
    #[default]
    Passthrough,
    /// [`NormalizationSchema::real_estate`]
    RealEstate,
    /// A schema spelled out in the file
    Custom(NormalizationSchema),
}

/// Transform stage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Normalization schema
    pub schema: SchemaChoice,
}

impl TransformConfig {
    /// The schema the transform worker is built with.
    #[must_use]
    pub fn schema(&self) -> NormalizationSchema {
        match &self.schema {
            SchemaChoice::Passthrough => NormalizationSchema::default(),
            SchemaChoice::RealEstate => NormalizationSchema::real_estate(),
            SchemaChoice::Custom(schema) => schema.clone(),
        }
    }
}

/// Delivery policy of one router subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Total attempts before dead-lettering, first attempt included
    pub max_attempts: u32,
    /// Maximum simultaneous handler invocations
    pub max_concurrency: usize,
    /// Execution budget of one attempt
    pub invocation_timeout_secs: u64,
    /// Delay before the first retry
    pub retry_initial_delay_ms: u64,
    /// Cap on the backoff delay
    pub retry_max_delay_ms: u64,
    /// Backoff growth factor
    pub retry_multiplier: f64,
    /// Routing rule replacing the stage's built-in one; it may only route
    /// the status the stage's worker handles
    pub pattern: Option<EventPattern>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_concurrency: 10,
            invocation_timeout_secs: 30,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            retry_multiplier: 2.0,
            pattern: None,
        }
    }
}

impl StageConfig {
    /// Validate the stage policy
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming `stage` if a bound is zero
    /// or the backoff settings are inconsistent.
    pub fn validate(&self, stage: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(format!(
                "stages.{stage}.max_attempts must be > 0"
            )));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Validation(format!(
                "stages.{stage}.max_concurrency must be > 0"
            )));
        }
        if self.invocation_timeout_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "stages.{stage}.invocation_timeout_secs must be > 0"
            )));
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "stages.{stage}.retry_initial_delay_ms must not exceed retry_max_delay_ms"
            )));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "stages.{stage}.retry_multiplier must be a finite number >= 1.0"
            )));
        }
        Ok(())
    }

    /// Backoff between attempts.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_attempts.saturating_sub(1))
            .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .multiplier(self.retry_multiplier)
            .build()
    }

    /// Execution budget of one attempt.
    #[must_use]
    pub const fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

/// Per-stage delivery policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    /// The `transform` subscription
    pub transform: StageConfig,
    /// The `load` subscription
    pub load: StageConfig,
}

/// Router-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// Dead letters per subscription tolerated before health degrades
    pub dead_letter_alert_threshold: u64,
    /// Retired deliveries kept queryable
    pub ledger_capacity: usize,
    /// How long shutdown waits for in-flight deliveries
    pub shutdown_timeout_secs: u64,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            dead_letter_alert_threshold: 0,
            ledger_capacity: 10_000,
            shutdown_timeout_secs: 30,
        }
    }
}

impl RouterSection {
    /// Validate router settings
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the ledger capacity is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_capacity == 0 {
            return Err(ConfigError::Validation(
                "router.ledger_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Router configuration built from these settings.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig::default()
            .with_dead_letter_alert_threshold(self.dead_letter_alert_threshold)
            .with_ledger_capacity(self.ledger_capacity)
    }

    /// Shutdown drain budget.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (loaded from `DATABASE_URL`, never from the file)
    #[serde(skip)]
    pub url: Option<String>,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            connect_timeout_secs: 5,
        }
    }
}

impl DatabaseConfig {
    /// Validate database configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be > 0".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "database.connect_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get connection timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the scrape endpoint; no exporter when unset
    pub listen_addr: Option<SocketAddr>,
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ingestion launcher
    pub launcher: LauncherConfig,
    /// CSV parsing
    pub ingestion: IngestionConfig,
    /// Transform stage
    pub transform: TransformConfig,
    /// Router subscriptions
    pub stages: StagesConfig,
    /// Router
    pub router: RouterSection,
    /// Durable stores
    pub database: DatabaseConfig,
    /// Metrics exporter
    pub metrics: MetricsConfig,
}

impl PipelineConfig {
    /// Load using the file named by `ROWFLOW_CONFIG`, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, an override is
    /// invalid, or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from);
        Self::load(path.as_deref())
    }

    /// Load defaults, then `path` (when given), then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, an override is
    /// invalid, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;

        tracing::debug!(
            path = ?path,
            key_prefix = %config.launcher.key_prefix,
            durable = config.database.url.is_some(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse a TOML document. Missing sections keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document does not match.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if `ROWFLOW_METRICS_ADDR` is not a
    /// socket address or an override is empty.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(DATABASE_URL_VAR) {
            if url.trim().is_empty() {
                return Err(ConfigError::InvalidEnv {
                    var: DATABASE_URL_VAR,
                    value: url,
                });
            }
            self.database.url = Some(url);
        }

        if let Some(prefix) = lookup(KEY_PREFIX_VAR) {
            self.launcher.key_prefix = prefix;
        }

        if let Some(addr) = lookup(METRICS_ADDR_VAR) {
            let parsed = addr.parse().map_err(|_| ConfigError::InvalidEnv {
                var: METRICS_ADDR_VAR,
                value: addr.clone(),
            })?;
            self.metrics.listen_addr = Some(parsed);
        }

        Ok(())
    }

    /// Validate entire configuration
    ///
    /// # Errors
    ///
    /// Returns error if any configuration section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.launcher
            .validate()
            .map_err(|e| ConfigError::Validation(format!("launcher: {e}")))?;
        if self.launcher.key_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "launcher.key_prefix cannot be empty".to_string(),
            ));
        }
        self.stages.transform.validate("transform")?;
        self.stages.load.validate("load")?;
        self.router.validate()?;
        self.database.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rowflow_workers::FieldKind;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.launcher.key_prefix, "upload/");
        assert_eq!(config.stages.transform.max_attempts, 3);
        assert_eq!(config.stages.load.max_concurrency, 10);
        assert_eq!(config.router.dead_letter_alert_threshold, 0);
        assert_eq!(config.transform.schema, SchemaChoice::Passthrough);
        assert!(config.database.url.is_none());
        assert!(config.metrics.listen_addr.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [launcher]
            key_prefix = "incoming/"

            [stages.load]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.launcher.key_prefix, "incoming/");
        assert_eq!(config.launcher.max_concurrency, 10);
        assert_eq!(config.stages.load.max_attempts, 5);
        assert_eq!(config.stages.load.max_concurrency, 10);
        assert_eq!(config.stages.transform, StageConfig::default());
    }

    #[test]
    fn test_schema_choices() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [transform]
            schema = "real_estate"
            "#,
        )
        .unwrap();
        assert_eq!(config.transform.schema(), NormalizationSchema::real_estate());

        let config = PipelineConfig::from_toml_str(
            r#"
            [transform.schema.custom]
            id_source = "correlation_id"

            [[transform.schema.custom.fields]]
            name = "price"
            kind = "integer"
            required = true
            "#,
        )
        .unwrap();
        let schema = config.transform.schema();
        assert_eq!(schema.fields.len(), 1);
        assert_eq!(schema.fields[0].kind, FieldKind::Integer);
        assert!(schema.fields[0].required);
    }

    #[test]
    fn test_stage_pattern_override() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [stages.transform.pattern]
            source = ["ingestion"]
            "#,
        )
        .unwrap();
        let pattern = config.stages.transform.pattern.unwrap();
        assert_eq!(pattern, EventPattern::default().with_source("ingestion"));
    }

    #[test]
    fn test_database_url_is_not_read_from_file() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [database]
            url = "postgres://leaked"
            max_connections = 3
            "#,
        )
        .unwrap();
        assert!(config.database.url.is_none());
        assert_eq!(config.database.max_connections, 3);
    }

    #[test]
    fn test_unknown_schema_is_a_parse_error() {
        let result = PipelineConfig::from_toml_str(
            r#"
            [transform]
            schema = "spreadsheet"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_overrides(env(&[
                ("DATABASE_URL", "postgres://localhost/rowflow"),
                ("ROWFLOW_KEY_PREFIX", "drop/"),
                ("ROWFLOW_METRICS_ADDR", "127.0.0.1:9100"),
            ]))
            .unwrap();

        assert_eq!(
            config.database.url.as_deref(),
            Some("postgres://localhost/rowflow")
        );
        assert_eq!(config.launcher.key_prefix, "drop/");
        assert_eq!(
            config.metrics.listen_addr,
            Some("127.0.0.1:9100".parse().unwrap())
        );
    }

    #[test]
    fn test_invalid_env_overrides() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_overrides(env(&[("ROWFLOW_METRICS_ADDR", "not-an-addr")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv { var: "ROWFLOW_METRICS_ADDR", .. }
        ));

        let err = config
            .apply_overrides(env(&[("DATABASE_URL", "  ")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var: "DATABASE_URL", .. }));
    }

    #[test]
    fn test_validation_names_the_section() {
        let mut config = PipelineConfig::default();
        config.stages.load.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stages.load.max_attempts"));

        let mut config = PipelineConfig::default();
        config.launcher.max_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = PipelineConfig::default();
        config.stages.transform.retry_initial_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.launcher.key_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_retry_policy() {
        let stage = StageConfig {
            max_attempts: 4,
            retry_initial_delay_ms: 10,
            retry_max_delay_ms: 40,
            ..StageConfig::default()
        };
        let policy = stage.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_millis(40));
        assert_eq!(stage.invocation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rowflow.toml");
        std::fs::write(&path, "[router]\nledger_capacity = 42\n").unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.router.ledger_capacity, 42);

        let missing = PipelineConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
