use async_trait::async_trait;
use std::env;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default prefix for environment-backed secrets.
pub const DEFAULT_ENV_PREFIX: &str = "WORKER_SECRET_";

/// Name-keyed secret lookup.
///
/// Implementations do not cache; wrap them in a
/// [`SecretCache`](super::SecretCache) for that.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<String, SecretError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Secret not found: {name}")]
    NotFound { name: String },

    #[error("Invalid secret name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Secret provider failed for '{name}': {message}")]
    Provider { name: String, message: String },
}

/// Reads secrets from environment variables named `<prefix><NAME>`.
///
/// The name is upper-cased, so `StorageConnectionString` is looked up as
/// `WORKER_SECRET_STORAGECONNECTIONSTRING` with the default prefix.
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
    prefix: String,
}

impl EnvSecretProvider {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn variable_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_uppercase())
    }
}

impl Default for EnvSecretProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretProvider for EnvSecretProvider {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        let variable = self.variable_name(name);
        debug!(name, variable = %variable, "Reading secret from environment");

        env::var(&variable).map_err(|e| match e {
            env::VarError::NotPresent => SecretError::NotFound {
                name: name.to_string(),
            },
            env::VarError::NotUnicode(_) => SecretError::Provider {
                name: name.to_string(),
                message: format!("{} is not valid unicode", variable),
            },
        })
    }
}

/// Reads secrets from files in a directory, one file per secret.
///
/// This is the layout produced by mounted secret volumes. Rotating a secret
/// means rewriting its file; the next uncached fetch sees the new value.
#[derive(Debug, Clone)]
pub struct FileSecretProvider {
    dir: PathBuf,
}

impl FileSecretProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SecretProvider for FileSecretProvider {
    async fn fetch(&self, name: &str) -> Result<String, SecretError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(SecretError::InvalidName {
                name: name.to_string(),
                reason: "must be a plain file name",
            });
        }

        let path = self.dir.join(name);
        debug!(name, path = %path.display(), "Reading secret from file");

        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(value.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(SecretError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(SecretError::Provider {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
