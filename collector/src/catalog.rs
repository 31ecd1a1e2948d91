use crate::model::ConnectorIdentity;
use crate::transform::TransformConfig;
use async_trait::async_trait;
use collector_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// One configured connector instance.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Connector kind, resolved through the source registry.
    pub connector: String,
    /// Logical name distinguishing instances of the same kind.
    pub name: String,
    #[serde(default)]
    pub frequency_secs: Option<u64>,
    /// Identifier handed to the secret backend at run start.
    #[serde(default)]
    pub secret: Option<String>,
    /// Connector-specific parameters, interpreted by the source.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
    #[serde(default)]
    pub disabled: bool,
}

impl InstanceConfig {
    pub fn identity(&self) -> ConnectorIdentity {
        ConnectorIdentity::new(self.connector.clone(), self.name.clone())
    }

    pub fn frequency(&self, default_secs: u64) -> Duration {
        Duration::from_secs(self.frequency_secs.unwrap_or(default_secs))
    }
}

/// The configuration collaborator: enumerates enabled connector instances.
/// Consumed read-only once per scheduling cycle or on reload.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<Vec<InstanceConfig>>;
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    instances: Vec<InstanceConfig>,
}

/// Loads instance definitions from a TOML document with `[[instances]]`
/// tables.
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileCatalog {
    async fn load(&self) -> Result<Vec<InstanceConfig>> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Config(format!(
                "instance catalog {} is unreadable: {e}",
                self.path.display()
            ))
        })?;

        let document: CatalogDocument = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("instance catalog is malformed: {e}")))?;

        let mut references = HashSet::new();
        for instance in &document.instances {
            if instance.connector.is_empty() || instance.name.is_empty() {
                return Err(Error::Validation(
                    "instances require both 'connector' and 'name'".to_string(),
                ));
            }
            if !references.insert(instance.identity().reference()) {
                return Err(Error::Validation(format!(
                    "duplicate instance '{}' in catalog",
                    instance.identity()
                )));
            }
        }

        Ok(document.instances)
    }
}
