use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub cache: CacheConfig,
    pub output: OutputConfig,
    pub secrets: SecretsConfig,
    pub catalog: CatalogConfig,
    pub scheduler: SchedulerConfig,
    pub collection: CollectionConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Backend kind: "memory" or "file".
    pub backend: String,
    /// Root directory for the file backend.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Backend kind: "stdout", "file" or "http".
    pub backend: String,
    /// Directory for the file backend.
    pub path: Option<String>,
    /// Endpoint for the http backend.
    pub url: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// Backend kind: "env" or "file".
    pub backend: String,
    /// Secrets document for the file backend.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Instance definition document (TOML, [[instances]] tables).
    pub path: String,
    pub refresh_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub tick_interval_ms: u64,
    pub default_frequency_secs: u64,
    /// TTL on the in-progress run marker; an expired marker may be taken over.
    pub marker_ttl_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionConfig {
    pub batch_size: usize,
    pub max_pages_per_run: u32,
    pub run_budget_secs: u64,
    /// Window collected on the very first run of an instance.
    pub lookback_days: i64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        // Layer on config file if it exists
        if Path::new("collector.toml").exists() {
            builder = builder.add_source(File::with_name("collector"));
        }

        // Layer on environment variables (COLLECTOR_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("COLLECTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Config = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.cache.backend.as_str() {
            "memory" => {}
            "file" => {
                if self.cache.path.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Message(
                        "cache.path is required for the file cache backend".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Message(format!(
                    "unknown cache backend '{other}'"
                )));
            }
        }

        match self.output.backend.as_str() {
            "stdout" => {}
            "file" => {
                if self.output.path.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Message(
                        "output.path is required for the file output backend".into(),
                    ));
                }
            }
            "http" => {
                if self.output.url.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Message(
                        "output.url is required for the http output backend".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Message(format!(
                    "unknown output backend '{other}'"
                )));
            }
        }

        if self.catalog.path.is_empty() {
            return Err(ConfigError::Message("catalog.path is required".into()));
        }

        if self.scheduler.workers == 0 {
            return Err(ConfigError::Message(
                "scheduler.workers must be greater than 0".into(),
            ));
        }

        if self.collection.batch_size == 0 {
            return Err(ConfigError::Message(
                "collection.batch_size must be greater than 0".into(),
            ));
        }

        if self.collection.max_pages_per_run == 0 {
            return Err(ConfigError::Message(
                "collection.max_pages_per_run must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig {
                backend: "file".to_string(),
                path: Some(".collector/cache".to_string()),
            },
            output: OutputConfig {
                backend: "stdout".to_string(),
                path: None,
                url: None,
                request_timeout_secs: 30,
            },
            secrets: SecretsConfig {
                backend: "env".to_string(),
                path: None,
            },
            catalog: CatalogConfig {
                path: "instances.toml".to_string(),
                refresh_interval_secs: 300,
            },
            scheduler: SchedulerConfig {
                workers: 8,
                tick_interval_ms: 500,
                default_frequency_secs: 600,
                marker_ttl_secs: 900,
                backoff_base_secs: 30,
                backoff_max_secs: 3600,
                shutdown_grace_secs: 30,
            },
            collection: CollectionConfig {
                batch_size: 500,
                max_pages_per_run: 100,
                run_budget_secs: 600,
                lookback_days: 7,
                max_retries: 3,
                retry_base_delay_ms: 1000,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: true,
                metrics_port: 9090,
            },
        }
    }
}
