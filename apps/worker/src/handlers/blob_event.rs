use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::messaging::{HandlerError, LeasedMessage, MessageHandler};
use crate::storage::CredentialedResourceClient;

pub const BLOB_CREATED: &str = "Microsoft.Storage.BlobCreated";

/// Event Grid style storage notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<BlobEventData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobEventData {
    pub url: String,
    #[serde(default)]
    pub blob_type: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
}

impl BlobEvent {
    /// Events without a type are treated as blob-created.
    pub fn is_blob_created(&self) -> bool {
        self.event_type.is_empty() || self.event_type == BLOB_CREATED
    }
}

/// Where a blob lives, derived from its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub container: String,
    /// Path inside the container, `/`-separated.
    pub blob_name: String,
    pub file_name: String,
    /// Includes the leading dot; empty when the name has none.
    pub extension: String,
}

impl BlobLocation {
    pub fn from_url(raw: &str) -> Result<Self, HandlerError> {
        let url = Url::parse(raw)
            .map_err(|e| HandlerError::InvalidPayload(format!("invalid blob url {raw}: {e}")))?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let [container, rest @ ..] = segments.as_slice() else {
            return Err(HandlerError::InvalidPayload(format!(
                "blob url has no container: {raw}"
            )));
        };
        let Some(file_name) = rest.last() else {
            return Err(HandlerError::InvalidPayload(format!(
                "blob url has no blob name: {raw}"
            )));
        };

        let extension = match file_name.rfind('.') {
            Some(dot) if dot + 1 < file_name.len() => file_name[dot..].to_string(),
            _ => String::new(),
        };

        Ok(Self {
            container: container.to_string(),
            blob_name: rest.join("/"),
            file_name: file_name.to_string(),
            extension,
        })
    }
}

/// Fetches the blob referenced by a blob-created event.
pub struct BlobEventHandler {
    storage: Arc<CredentialedResourceClient>,
}

impl BlobEventHandler {
    pub fn new(storage: Arc<CredentialedResourceClient>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl MessageHandler for BlobEventHandler {
    async fn handle(&self, message: &LeasedMessage) -> Result<(), HandlerError> {
        let event: BlobEvent = serde_json::from_slice(&message.body)
            .map_err(|e| HandlerError::InvalidPayload(format!("not a blob event: {e}")))?;

        if !event.is_blob_created() {
            debug!(id = %message.id, event_type = %event.event_type, "Ignoring event");
            return Ok(());
        }

        let data = event
            .data
            .ok_or_else(|| HandlerError::InvalidPayload("blob event without data".to_string()))?;
        let location = BlobLocation::from_url(&data.url)?;

        info!(
            id = %message.id,
            container = %location.container,
            blob = %location.blob_name,
            extension = %location.extension,
            blob_type = data.blob_type.as_deref().unwrap_or("unknown"),
            "Processing blob"
        );

        let bytes = self
            .storage
            .download(&location.container, &location.blob_name)
            .await?;

        info!(
            id = %message.id,
            blob = %location.file_name,
            size = bytes.len(),
            "Blob downloaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::secrets::{FileSecretProvider, SecretCache};
    use crate::storage::{FsConnector, ResourceError, RetryPolicy, StorageError};
    use std::time::Duration;
    use tokio::time::Instant;

    fn message(body: &str) -> LeasedMessage {
        LeasedMessage {
            id: "evt-1".into(),
            receipt_token: "r".into(),
            body: body.as_bytes().to_vec(),
            lease_expiry: Instant::now() + Duration::from_secs(30),
            dequeue_count: 1,
        }
    }

    fn created_event(url: &str) -> String {
        serde_json::json!({
            "topic": "/subscriptions/x/storageAccounts/acct",
            "subject": "/blobServices/default/containers/uploads",
            "eventType": BLOB_CREATED,
            "id": "1",
            "data": { "url": url, "blobType": "BlockBlob", "contentLength": 12 }
        })
        .to_string()
    }

    #[test]
    fn test_location_from_nested_url() {
        let location =
            BlobLocation::from_url("https://acct.blob.core.windows.net/uploads/2024/05/users.csv")
                .unwrap();
        assert_eq!(location.container, "uploads");
        assert_eq!(location.blob_name, "2024/05/users.csv");
        assert_eq!(location.file_name, "users.csv");
        assert_eq!(location.extension, ".csv");
    }

    #[test]
    fn test_location_extension_edge_cases() {
        let plain = BlobLocation::from_url("https://acct/uploads/README").unwrap();
        assert_eq!(plain.extension, "");

        let trailing = BlobLocation::from_url("https://acct/uploads/archive.").unwrap();
        assert_eq!(trailing.extension, "");

        let double = BlobLocation::from_url("https://acct/uploads/data.tar.gz").unwrap();
        assert_eq!(double.extension, ".gz");
    }

    #[test]
    fn test_location_requires_container_and_blob() {
        assert!(BlobLocation::from_url("https://acct/").is_err());
        assert!(BlobLocation::from_url("https://acct/uploads/").is_err());
        assert!(BlobLocation::from_url("not a url").is_err());
    }

    async fn handler_over(blobs: &std::path::Path, secrets: &std::path::Path) -> (BlobEventHandler, Arc<CredentialedResourceClient>) {
        std::fs::write(
            secrets.join("StorageConnectionString"),
            format!("BlobRoot={};AccountKey=k", blobs.display()),
        )
        .unwrap();
        let cache = Arc::new(SecretCache::with_default_ttl(Arc::new(FileSecretProvider::new(
            secrets,
        ))));
        let client = Arc::new(
            CredentialedResourceClient::connect(
                cache,
                "StorageConnectionString",
                Arc::new(FsConnector),
                RetryPolicy::fixed(3, Duration::from_millis(5)),
                Metrics::new().unwrap(),
            )
            .await
            .unwrap(),
        );
        (BlobEventHandler::new(client.clone()), client)
    }

    #[tokio::test]
    async fn test_downloads_created_blob() {
        let blobs = tempfile::tempdir().unwrap();
        let secrets = tempfile::tempdir().unwrap();
        let (handler, client) = handler_over(blobs.path(), secrets.path()).await;

        client
            .upload("uploads", "2024/users.csv", b"id,name\n1,a\n")
            .await
            .unwrap();

        let body = created_event("https://acct.blob.core.windows.net/uploads/2024/users.csv");
        handler.handle(&message(&body)).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_blob_fails_without_retrying() {
        let blobs = tempfile::tempdir().unwrap();
        let secrets = tempfile::tempdir().unwrap();
        let (handler, _client) = handler_over(blobs.path(), secrets.path()).await;

        let body = created_event("https://acct.blob.core.windows.net/uploads/missing.csv");
        let err = handler.handle(&message(&body)).await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Storage(ResourceError::NonRetryable {
                source: StorageError::NotFound(_),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_ignores_other_events_and_rejects_garbage() {
        let blobs = tempfile::tempdir().unwrap();
        let secrets = tempfile::tempdir().unwrap();
        let (handler, _client) = handler_over(blobs.path(), secrets.path()).await;

        let deleted = serde_json::json!({
            "eventType": "Microsoft.Storage.BlobDeleted",
            "data": { "url": "https://acct/uploads/gone.csv" }
        })
        .to_string();
        handler.handle(&message(&deleted)).await.unwrap();

        let err = handler.handle(&message("{not json")).await.unwrap_err();
        assert_eq!(err.error_type(), "invalid_payload");
    }
}
