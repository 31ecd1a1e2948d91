use async_trait::async_trait;
use collector_core::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;

/// Resolves credential material for connectors at run start. A resolution
/// failure disables the instance until an operator fixes the configuration.
#[async_trait]
pub trait SecretSource: Send + Sync {
    async fn resolve(&self, identifier: &str) -> Result<String>;
}

/// Reads secrets from process environment variables; the identifier is the
/// variable name.
#[derive(Default)]
pub struct EnvSecrets;

impl EnvSecrets {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SecretSource for EnvSecrets {
    async fn resolve(&self, identifier: &str) -> Result<String> {
        std::env::var(identifier)
            .map_err(|_| Error::Auth(format!("secret '{identifier}' is not set in the environment")))
    }
}

/// Reads secrets from a JSON document mapping identifiers to values. The
/// document is re-read on every resolution so rotated credentials are picked
/// up without a restart.
pub struct FileSecrets {
    path: PathBuf,
}

impl FileSecrets {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretSource for FileSecrets {
    async fn resolve(&self, identifier: &str) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Auth(format!(
                "secrets document {} is unreadable: {e}",
                self.path.display()
            ))
        })?;

        let secrets: HashMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| Error::Auth(format!("secrets document is malformed: {e}")))?;

        secrets.get(identifier).cloned().ok_or_else(|| {
            Error::Auth(format!(
                "secret '{identifier}' not present in {}",
                self.path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_secrets_resolve_by_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        tokio::fs::write(&path, r#"{"CORP_TOKEN": "s3cret"}"#)
            .await
            .unwrap();

        let secrets = FileSecrets::new(&path);
        assert_eq!(secrets.resolve("CORP_TOKEN").await.unwrap(), "s3cret");

        let missing = secrets.resolve("OTHER").await.unwrap_err();
        assert!(missing.is_fatal());
    }

    #[tokio::test]
    async fn env_secrets_missing_variable_is_fatal() {
        let secrets = EnvSecrets::new();
        let error = secrets
            .resolve("COLLECTOR_TEST_SECRET_THAT_DOES_NOT_EXIST")
            .await
            .unwrap_err();
        assert!(error.is_fatal());
    }
}
