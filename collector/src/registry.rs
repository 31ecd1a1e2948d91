use crate::cache::{Cache, FileCache, MemoryCache};
use crate::catalog::{ConfigSource, FileCatalog, InstanceConfig};
use crate::output::{FileOutput, HttpOutput, Output, StdoutOutput};
use crate::secrets::{EnvSecrets, FileSecrets, SecretSource};
use crate::sources::{FileSource, LogSource, RestSource};
use collector_core::config::{CacheConfig, CatalogConfig, OutputConfig, SecretsConfig};
use collector_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Startup-time lookup tables mapping backend and connector kinds to
/// constructors. All implementations are statically linked; there is no
/// runtime code loading.

pub async fn build_cache(config: &CacheConfig) -> Result<Arc<dyn Cache>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryCache::new())),
        "file" => {
            let path = config.path.as_deref().ok_or_else(|| {
                Error::Config("cache.path is required for the file backend".to_string())
            })?;
            Ok(Arc::new(FileCache::new(path).await?))
        }
        other => Err(Error::Config(format!("unknown cache backend '{other}'"))),
    }
}

pub async fn build_output(config: &OutputConfig) -> Result<Arc<dyn Output>> {
    match config.backend.as_str() {
        "stdout" => Ok(Arc::new(StdoutOutput::new())),
        "file" => {
            let path = config.path.as_deref().ok_or_else(|| {
                Error::Config("output.path is required for the file backend".to_string())
            })?;
            Ok(Arc::new(FileOutput::new(path).await?))
        }
        "http" => {
            let url = config.url.as_deref().ok_or_else(|| {
                Error::Config("output.url is required for the http backend".to_string())
            })?;
            Ok(Arc::new(HttpOutput::new(
                url,
                Duration::from_secs(config.request_timeout_secs),
            )?))
        }
        other => Err(Error::Config(format!("unknown output backend '{other}'"))),
    }
}

pub fn build_secrets(config: &SecretsConfig) -> Result<Arc<dyn SecretSource>> {
    match config.backend.as_str() {
        "env" => Ok(Arc::new(EnvSecrets::new())),
        "file" => {
            let path = config.path.as_deref().ok_or_else(|| {
                Error::Config("secrets.path is required for the file backend".to_string())
            })?;
            Ok(Arc::new(FileSecrets::new(path)))
        }
        other => Err(Error::Config(format!("unknown secrets backend '{other}'"))),
    }
}

pub fn build_catalog(config: &CatalogConfig) -> Result<Arc<dyn ConfigSource>> {
    Ok(Arc::new(FileCatalog::new(config.path.clone())))
}

/// Construct the source for one run. Sources are rebuilt per run so no
/// connector state leaks between executions.
pub fn build_source(instance: &InstanceConfig, secret: Option<String>) -> Result<Arc<dyn LogSource>> {
    match instance.connector.as_str() {
        "rest" => Ok(Arc::new(RestSource::from_params(&instance.params, secret)?)),
        "file" => Ok(Arc::new(FileSource::from_params(&instance.params)?)),
        other => Err(Error::Config(format!("unknown connector kind '{other}'"))),
    }
}
