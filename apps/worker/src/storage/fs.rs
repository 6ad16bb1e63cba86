//! Filesystem-backed blob store.
//!
//! Containers are directories under a root, blobs are files inside them
//! (keys may contain `/`). The store is reached through a connection string
//! `BlobRoot=<dir>;AccountKey=<key>`. When `<root>/.account-key` exists every
//! call checks the presented key against it, so rewriting that file rotates
//! the credential out from under running clients.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::backend::{BackendConnector, StorageBackend, StorageError};

pub const ACCOUNT_KEY_FILE: &str = ".account-key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub blob_root: PathBuf,
    pub account_key: Option<String>,
}

impl FromStr for ConnectionString {
    type Err = StorageError;

    /// Parses `Key=Value` pairs separated by `;`. Keys are case-insensitive
    /// and unknown keys are ignored.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut blob_root = None;
        let mut account_key = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                StorageError::InvalidInput(format!("malformed connection string segment '{}'", key_only(part)))
            })?;
            match key.trim().to_ascii_lowercase().as_str() {
                "blobroot" => blob_root = Some(PathBuf::from(value.trim())),
                "accountkey" => account_key = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let blob_root = blob_root
            .filter(|root| !root.as_os_str().is_empty())
            .ok_or_else(|| StorageError::InvalidInput("connection string has no BlobRoot".to_string()))?;

        Ok(Self {
            blob_root,
            account_key,
        })
    }
}

// Never echo secret material back in errors.
fn key_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or_default()
}

fn map_io(err: std::io::Error, what: &str) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound(what.to_string()),
        ErrorKind::PermissionDenied => StorageError::Forbidden(format!("{}: {}", what, err)),
        ErrorKind::TimedOut => StorageError::Timeout(format!("{}: {}", what, err)),
        ErrorKind::AlreadyExists => StorageError::Conflict(format!("{}: {}", what, err)),
        _ => StorageError::Unavailable(format!("{}: {}", what, err)),
    }
}

fn validate_container(container: &str) -> Result<(), StorageError> {
    if container.is_empty()
        || container.starts_with('.')
        || container.contains(['/', '\\'])
    {
        return Err(StorageError::InvalidInput(format!(
            "invalid container name '{}'",
            container
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let bad_segment = key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if key.is_empty() || key.contains('\\') || bad_segment {
        return Err(StorageError::InvalidInput(format!("invalid blob key '{}'", key)));
    }
    Ok(())
}

pub struct FsBlobStore {
    root: PathBuf,
    account_key: Option<String>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, account_key: Option<String>) -> Self {
        Self {
            root: root.into(),
            account_key,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn authorize(&self) -> Result<(), StorageError> {
        let expected = match tokio::fs::read_to_string(self.root.join(ACCOUNT_KEY_FILE)).await {
            Ok(expected) => expected,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(e, "account key")),
        };

        match &self.account_key {
            Some(presented) if presented == expected.trim() => Ok(()),
            Some(_) => Err(StorageError::Unauthorized(
                "account key was rejected by the store".to_string(),
            )),
            None => Err(StorageError::Unauthorized(
                "no account key presented".to_string(),
            )),
        }
    }

    fn container_path(&self, container: &str) -> Result<PathBuf, StorageError> {
        validate_container(container)?;
        Ok(self.root.join(container))
    }

    fn blob_path(&self, container: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.container_path(container)?.join(key))
    }

    fn locator(path: &Path) -> Result<String, StorageError> {
        Url::from_file_path(path)
            .map(|url| url.to_string())
            .map_err(|_| StorageError::InvalidInput(format!("cannot build locator for {}", path.display())))
    }
}

#[async_trait]
impl StorageBackend for FsBlobStore {
    async fn upload(&self, container: &str, key: &str, bytes: &[u8]) -> Result<String, StorageError> {
        self.authorize().await?;
        let path = self.blob_path(container, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(e, container))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| map_io(e, key))?;

        debug!(container, key, size = bytes.len(), "Blob written");
        Self::locator(&path)
    }

    async fn download(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.authorize().await?;
        let path = self.blob_path(container, key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| map_io(e, &format!("blob {}/{}", container, key)))
    }

    async fn exists(&self, container: &str, key: &str) -> Result<bool, StorageError> {
        self.authorize().await?;
        let path = self.blob_path(container, key)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(e, key)),
        }
    }

    async fn list(&self, container: &str) -> Result<Vec<String>, StorageError> {
        self.authorize().await?;
        let base = self.container_path(container)?;
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| map_io(e, &format!("container {}", container)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| map_io(e, container))?
            {
                let file_type = entry.file_type().await.map_err(|e| map_io(e, container))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&base) {
                    let key: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    keys.push(key.join("/"));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError> {
        self.authorize().await?;
        let path = self.blob_path(container, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e, key)),
        }
    }

    async fn ensure_container(&self, container: &str) -> Result<(), StorageError> {
        self.authorize().await?;
        let path = self.container_path(container)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| map_io(e, container))
    }

    async fn container_exists(&self, container: &str) -> Result<bool, StorageError> {
        self.authorize().await?;
        let path = self.container_path(container)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(e, container)),
        }
    }

    async fn list_containers(&self) -> Result<Vec<String>, StorageError> {
        self.authorize().await?;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io(e, "blob root")),
        };

        let mut containers = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| map_io(e, "blob root"))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| map_io(e, "blob root"))?
                .is_dir();
            if is_dir && !name.starts_with('.') {
                containers.push(name);
            }
        }

        containers.sort();
        Ok(containers)
    }

    async fn delete_container(&self, container: &str) -> Result<(), StorageError> {
        self.authorize().await?;
        let path = self.container_path(container)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e, container)),
        }
    }
}

/// Connects [`FsBlobStore`]s from connection strings.
#[derive(Debug, Clone, Default)]
pub struct FsConnector;

#[async_trait]
impl BackendConnector for FsConnector {
    async fn connect(&self, secret: &str) -> Result<Arc<dyn StorageBackend>, StorageError> {
        let connection: ConnectionString = secret.parse()?;
        let root = std::path::absolute(&connection.blob_root)
            .map_err(|e| StorageError::InvalidInput(format!("invalid BlobRoot: {}", e)))?;

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| map_io(e, "blob root"))?;

        info!(
            event = "storage_connected",
            root = %root.display(),
            authenticated = connection.account_key.is_some(),
            "Filesystem blob store connected"
        );

        Ok(Arc::new(FsBlobStore::new(root, connection.account_key)))
    }
}
