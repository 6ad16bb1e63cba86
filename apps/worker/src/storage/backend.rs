use async_trait::async_trait;
use std::sync::Arc;

/// Substrings that mark a free-form error message as a credential problem.
const AUTH_MARKERS: [&str; 5] = [
    "authentication",
    "authorization",
    "unauthorized",
    "forbidden",
    "expired",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage request timed out: {0}")]
    Timeout(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

/// How the retry loop should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Authentication,
    Transient,
    NonRetryable,
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unauthorized(_) | Self::Forbidden(_) | Self::CredentialExpired(_) => {
                ErrorClass::Authentication
            }
            Self::Unavailable(_) | Self::Timeout(_) => ErrorClass::Transient,
            Self::InvalidInput(_) | Self::NotFound(_) | Self::Conflict(_) => {
                ErrorClass::NonRetryable
            }
            Self::Other(message) => {
                let message = message.to_lowercase();
                if AUTH_MARKERS.iter().any(|marker| message.contains(marker)) {
                    ErrorClass::Authentication
                } else {
                    ErrorClass::Transient
                }
            }
        }
    }

    pub fn is_authentication(&self) -> bool {
        self.class() == ErrorClass::Authentication
    }
}

/// Blob storage operations against one account.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Writes (overwriting) a blob, creating the container if needed.
    /// Returns a locator for the stored blob.
    async fn upload(&self, container: &str, key: &str, bytes: &[u8]) -> Result<String, StorageError>;

    async fn download(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn exists(&self, container: &str, key: &str) -> Result<bool, StorageError>;

    /// Blob keys in the container, sorted.
    async fn list(&self, container: &str) -> Result<Vec<String>, StorageError>;

    /// Deletes a blob; deleting a missing blob succeeds.
    async fn delete(&self, container: &str, key: &str) -> Result<(), StorageError>;

    async fn ensure_container(&self, container: &str) -> Result<(), StorageError>;

    async fn container_exists(&self, container: &str) -> Result<bool, StorageError>;

    async fn list_containers(&self) -> Result<Vec<String>, StorageError>;

    /// Deletes a container and its blobs; deleting a missing container succeeds.
    async fn delete_container(&self, container: &str) -> Result<(), StorageError>;
}

/// Builds a backend from a secret (connection string or token).
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, secret: &str) -> Result<Arc<dyn StorageBackend>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_variants_classify() {
        assert_eq!(
            StorageError::Unauthorized("key rejected".into()).class(),
            ErrorClass::Authentication
        );
        assert_eq!(
            StorageError::CredentialExpired("sas".into()).class(),
            ErrorClass::Authentication
        );
        assert_eq!(
            StorageError::Timeout("upload".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            StorageError::InvalidInput("empty key".into()).class(),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            StorageError::NotFound("blob".into()).class(),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn test_free_form_messages_classify_by_content() {
        assert!(StorageError::Other("Server failed to authenticate: Authentication failed".into())
            .is_authentication());
        assert!(StorageError::Other("403 FORBIDDEN".into()).is_authentication());
        assert!(StorageError::Other("The SAS token has expired".into()).is_authentication());
        assert_eq!(
            StorageError::Other("connection reset by peer".into()).class(),
            ErrorClass::Transient
        );
    }
}
