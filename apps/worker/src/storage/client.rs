use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backend::{BackendConnector, StorageBackend, StorageError};
use super::retry::{classify, RetryPolicy};
use crate::contracts::AttemptOutcome;
use crate::metrics::Metrics;
use crate::secrets::{SecretCache, SecretError};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Failed to obtain storage credentials: {0}")]
    Credentials(#[from] SecretError),

    #[error("Failed to connect to storage: {source}")]
    Connect { source: StorageError },

    #[error("{operation} failed with a non-retryable error: {source}")]
    NonRetryable {
        operation: &'static str,
        source: StorageError,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: &'static str,
        attempts: u32,
        source: StorageError,
    },
}

impl ResourceError {
    /// The storage error behind a failed operation, if any.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            Self::Credentials(_) => None,
            Self::Connect { source }
            | Self::NonRetryable { source, .. }
            | Self::RetryExhausted { source, .. } => Some(source),
        }
    }
}

/// The current backend and how many builds produced it.
#[derive(Clone)]
struct ClientHandle {
    backend: Arc<dyn StorageBackend>,
    generation: u64,
}

/// Storage client that re-authenticates itself.
///
/// Callers clone the current handle out of a short read lock before each
/// attempt; a rebuild swaps the whole handle under the write lock, so an
/// attempt runs against either the old or the new backend, never a mix.
/// No lock is held while an operation or a credential fetch is in flight.
pub struct CredentialedResourceClient {
    secrets: Arc<SecretCache>,
    secret_name: String,
    connector: Arc<dyn BackendConnector>,
    current: RwLock<ClientHandle>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl CredentialedResourceClient {
    pub async fn connect(
        secrets: Arc<SecretCache>,
        secret_name: impl Into<String>,
        connector: Arc<dyn BackendConnector>,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ResourceError> {
        let secret_name = secret_name.into();
        let secret = secrets.get(&secret_name).await?;
        let backend = connector
            .connect(&secret)
            .await
            .map_err(|source| ResourceError::Connect { source })?;

        info!(
            event = "client_built",
            name = %secret_name,
            generation = 1,
            outcome = "connected",
            "Storage client connected"
        );

        Ok(Self {
            secrets,
            secret_name,
            connector,
            current: RwLock::new(ClientHandle {
                backend,
                generation: 1,
            }),
            policy,
            metrics,
        })
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Number of times the backend handle has been built (1 after connect).
    pub async fn generation(&self) -> u64 {
        self.current.read().await.generation
    }

    pub async fn upload(&self, container: &str, key: &str, bytes: &[u8]) -> Result<String, ResourceError> {
        info!(container, key, size = bytes.len(), "Uploading blob");
        self.execute("upload", move |backend| async move {
            backend.upload(container, key, bytes).await
        })
        .await
    }

    pub async fn download(&self, container: &str, key: &str) -> Result<Vec<u8>, ResourceError> {
        info!(container, key, "Downloading blob");
        self.execute("download", move |backend| async move {
            backend.download(container, key).await
        })
        .await
    }

    pub async fn exists(&self, container: &str, key: &str) -> Result<bool, ResourceError> {
        self.execute("exists", move |backend| async move {
            backend.exists(container, key).await
        })
        .await
    }

    pub async fn list(&self, container: &str) -> Result<Vec<String>, ResourceError> {
        info!(container, "Listing blobs");
        self.execute("list", move |backend| async move { backend.list(container).await })
            .await
    }

    pub async fn delete(&self, container: &str, key: &str) -> Result<(), ResourceError> {
        info!(container, key, "Deleting blob");
        self.execute("delete", move |backend| async move {
            backend.delete(container, key).await
        })
        .await
    }

    pub async fn ensure_container(&self, container: &str) -> Result<(), ResourceError> {
        info!(container, "Ensuring container");
        self.execute("ensure_container", move |backend| async move {
            backend.ensure_container(container).await
        })
        .await
    }

    pub async fn container_exists(&self, container: &str) -> Result<bool, ResourceError> {
        self.execute("container_exists", move |backend| async move {
            backend.container_exists(container).await
        })
        .await
    }

    pub async fn list_containers(&self) -> Result<Vec<String>, ResourceError> {
        self.execute("list_containers", |backend| async move {
            backend.list_containers().await
        })
        .await
    }

    pub async fn delete_container(&self, container: &str) -> Result<(), ResourceError> {
        info!(container, "Deleting container");
        self.execute("delete_container", move |backend| async move {
            backend.delete_container(container).await
        })
        .await
    }

    async fn current_handle(&self) -> ClientHandle {
        self.current.read().await.clone()
    }

    async fn execute<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, ResourceError>
    where
        F: Fn(Arc<dyn StorageBackend>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = self.policy.first_attempt();

        loop {
            let handle = self.current_handle().await;
            debug!(
                event = "storage_attempt",
                operation,
                attempt = attempt.attempt_number,
                max_attempts = attempt.max_attempts,
                generation = handle.generation,
                "Attempt {} of {}",
                attempt.attempt_number,
                attempt.max_attempts
            );

            let outcome = classify(op(handle.backend.clone()).await);
            self.metrics
                .storage_attempts_total
                .with_label_values(&[operation, outcome.label()])
                .inc();

            let cause = match outcome {
                AttemptOutcome::Success(value) => {
                    debug!(
                        event = "storage_attempt",
                        operation,
                        attempt = attempt.attempt_number,
                        outcome = "success",
                        "Storage operation succeeded"
                    );
                    return Ok(value);
                }
                AttemptOutcome::Fatal(source) => {
                    warn!(
                        event = "storage_attempt",
                        operation,
                        attempt = attempt.attempt_number,
                        outcome = "fatal",
                        error = %source,
                        "Non-retryable storage error"
                    );
                    return Err(ResourceError::NonRetryable { operation, source });
                }
                AttemptOutcome::Reauthenticate(source) => {
                    warn!(
                        event = "storage_attempt",
                        operation,
                        attempt = attempt.attempt_number,
                        outcome = "auth_failure",
                        error = %source,
                        "Authentication error, refreshing credentials"
                    );
                    self.refresh_credentials(handle.generation).await;
                    source
                }
                AttemptOutcome::Retryable(source) => {
                    warn!(
                        event = "storage_attempt",
                        operation,
                        attempt = attempt.attempt_number,
                        outcome = "transient_failure",
                        error = %source,
                        "Transient storage error"
                    );
                    source
                }
            };

            match attempt.next(&self.policy) {
                Some(next) => {
                    tokio::time::sleep(attempt.delay).await;
                    attempt = next;
                }
                None => {
                    error!(
                        event = "storage_retry_exhausted",
                        operation,
                        attempt = attempt.attempt_number,
                        outcome = "retry_exhausted",
                        error = %cause,
                        "Storage operation failed after maximum retries"
                    );
                    return Err(ResourceError::RetryExhausted {
                        operation,
                        attempts: attempt.attempt_number,
                        source: cause,
                    });
                }
            }
        }
    }

    /// Invalidates the cached secret, fetches a fresh one and swaps in a new
    /// backend. Skipped when the failing attempt ran on a handle that has
    /// already been replaced by a concurrent caller.
    async fn refresh_credentials(&self, failed_generation: u64) {
        if self.current.read().await.generation != failed_generation {
            debug!(
                event = "client_rebuild",
                name = %self.secret_name,
                outcome = "already_rebuilt",
                "Client was rebuilt by another caller"
            );
            return;
        }

        let started = Instant::now();
        self.secrets.invalidate(&self.secret_name).await;
        self.metrics
            .secret_invalidations_total
            .with_label_values(&[self.secret_name.as_str()])
            .inc();

        let secret = match self.secrets.get(&self.secret_name).await {
            Ok(secret) => secret,
            Err(e) => {
                error!(
                    event = "client_rebuild",
                    name = %self.secret_name,
                    outcome = "secret_fetch_failed",
                    error = %e,
                    "Failed to refetch storage secret"
                );
                return;
            }
        };

        let backend = match self.connector.connect(&secret).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    event = "client_rebuild",
                    name = %self.secret_name,
                    outcome = "connect_failed",
                    error = %e,
                    "Failed to rebuild storage client"
                );
                return;
            }
        };

        let mut current = self.current.write().await;
        if current.generation != failed_generation {
            debug!(
                event = "client_rebuild",
                name = %self.secret_name,
                outcome = "already_rebuilt",
                "Discarding rebuild, a newer client is in place"
            );
            return;
        }

        *current = ClientHandle {
            backend,
            generation: failed_generation + 1,
        };
        self.metrics
            .client_rebuild_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        info!(
            event = "client_rebuild",
            name = %self.secret_name,
            generation = current.generation,
            outcome = "rebuilt",
            "Storage client connection refreshed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{FileSecretProvider, SecretProvider};
    use crate::storage::fs::{FsConnector, ACCOUNT_KEY_FILE};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    /// Hands out `secret-1`, `secret-2`, ... and journals every fetch,
    /// preceded by `invalidate:<name>` when the client recorded an
    /// invalidation since the previous fetch.
    struct RotatingProvider {
        journal: Journal,
        fetches: Mutex<u32>,
        metrics: Arc<Metrics>,
        seen_invalidations: Mutex<f64>,
    }

    #[async_trait]
    impl SecretProvider for RotatingProvider {
        async fn fetch(&self, name: &str) -> Result<String, SecretError> {
            let invalidations = self
                .metrics
                .secret_invalidations_total
                .with_label_values(&[name])
                .get();
            let mut seen = self.seen_invalidations.lock().unwrap();
            if invalidations > *seen {
                *seen = invalidations;
                self.journal.lock().unwrap().push(format!("invalidate:{}", name));
            }
            drop(seen);

            let mut fetches = self.fetches.lock().unwrap();
            *fetches += 1;
            let value = format!("secret-{}", fetches);
            self.journal.lock().unwrap().push(format!("fetch:{}:{}", name, value));
            Ok(value)
        }
    }

    /// Backend whose `download` answers come from a shared script.
    struct ScriptedBackend {
        secret: String,
        journal: Journal,
        script: Arc<Mutex<VecDeque<Result<Vec<u8>, StorageError>>>>,
    }

    #[async_trait]
    impl StorageBackend for ScriptedBackend {
        async fn upload(&self, _: &str, _: &str, _: &[u8]) -> Result<String, StorageError> {
            unreachable!()
        }

        async fn download(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("download:{}/{}@{}", container, key, self.secret));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(StorageError::Unavailable("script exhausted".into())))
        }

        async fn exists(&self, _: &str, _: &str) -> Result<bool, StorageError> {
            unreachable!()
        }

        async fn list(&self, _: &str) -> Result<Vec<String>, StorageError> {
            unreachable!()
        }

        async fn delete(&self, _: &str, _: &str) -> Result<(), StorageError> {
            unreachable!()
        }

        async fn ensure_container(&self, _: &str) -> Result<(), StorageError> {
            unreachable!()
        }

        async fn container_exists(&self, _: &str) -> Result<bool, StorageError> {
            unreachable!()
        }

        async fn list_containers(&self) -> Result<Vec<String>, StorageError> {
            unreachable!()
        }

        async fn delete_container(&self, _: &str) -> Result<(), StorageError> {
            unreachable!()
        }
    }

    struct ScriptedConnector {
        journal: Journal,
        script: Arc<Mutex<VecDeque<Result<Vec<u8>, StorageError>>>>,
    }

    #[async_trait]
    impl BackendConnector for ScriptedConnector {
        async fn connect(&self, secret: &str) -> Result<Arc<dyn StorageBackend>, StorageError> {
            self.journal.lock().unwrap().push(format!("connect:{}", secret));
            Ok(Arc::new(ScriptedBackend {
                secret: secret.to_string(),
                journal: self.journal.clone(),
                script: self.script.clone(),
            }))
        }
    }

    async fn scripted_client(
        script: Vec<Result<Vec<u8>, StorageError>>,
    ) -> (CredentialedResourceClient, Journal) {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let metrics = Metrics::new().unwrap();
        let provider = Arc::new(RotatingProvider {
            journal: journal.clone(),
            fetches: Mutex::new(0),
            metrics: metrics.clone(),
            seen_invalidations: Mutex::new(0.0),
        });
        let cache = Arc::new(SecretCache::with_default_ttl(provider));
        let connector = Arc::new(ScriptedConnector {
            journal: journal.clone(),
            script: Arc::new(Mutex::new(script.into())),
        });

        let client = CredentialedResourceClient::connect(
            cache,
            "conn",
            connector,
            RetryPolicy::fixed(3, Duration::from_secs(1)),
            metrics,
        )
        .await
        .unwrap();

        (client, journal)
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_invalidates_refetches_and_rebuilds_before_retry() {
        let (client, journal) = scripted_client(vec![
            Err(StorageError::Unauthorized("key rotated".into())),
            Ok(b"data".to_vec()),
        ])
        .await;

        let bytes = client.download("c", "k").await.unwrap();

        assert_eq!(bytes, b"data");
        assert_eq!(client.generation().await, 2);
        assert_eq!(
            entries(&journal),
            vec![
                "fetch:conn:secret-1",
                "connect:secret-1",
                "download:c/k@secret-1",
                "invalidate:conn",
                "fetch:conn:secret-2",
                "connect:secret-2",
                "download:c/k@secret-2",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_transient_failure_exhausts_after_three_attempts() {
        let failure = || Err(StorageError::Unavailable("503".into()));
        let (client, journal) = scripted_client(vec![failure(), failure(), failure(), failure()]).await;

        let started = Instant::now();
        let err = client.download("c", "k").await.unwrap_err();

        match err {
            ResourceError::RetryExhausted {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "download");
                assert_eq!(attempts, 3);
                assert_eq!(source, StorageError::Unavailable("503".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let downloads = entries(&journal)
            .iter()
            .filter(|e| e.starts_with("download:"))
            .count();
        assert_eq!(downloads, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(client.generation().await, 1);
        // transient failures never touch the cache
        assert_eq!(entries(&journal).iter().filter(|e| e.starts_with("fetch:")).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_propagates_immediately() {
        let (client, journal) = scripted_client(vec![Err(StorageError::NotFound("blob c/k".into()))]).await;

        let err = client.download("c", "k").await.unwrap_err();

        assert!(matches!(
            err,
            ResourceError::NonRetryable {
                operation: "download",
                source: StorageError::NotFound(_)
            }
        ));
        assert_eq!(
            entries(&journal)
                .iter()
                .filter(|e| e.starts_with("download:"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success_keeps_client() {
        let (client, _journal) = scripted_client(vec![
            Err(StorageError::Timeout("slow".into())),
            Ok(b"late".to_vec()),
        ])
        .await;

        assert_eq!(client.download("c", "k").await.unwrap(), b"late");
        assert_eq!(client.generation().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_auth_failures_exhaust_with_auth_cause() {
        let denied = || Err(StorageError::Forbidden("denied".into()));
        let (client, _journal) = scripted_client(vec![denied(), denied(), denied()]).await;

        let err = client.download("c", "k").await.unwrap_err();
        assert!(matches!(
            err,
            ResourceError::RetryExhausted {
                attempts: 3,
                source: StorageError::Forbidden(_),
                ..
            }
        ));
        assert_eq!(client.generation().await, 4);
    }

    #[tokio::test]
    async fn test_stale_generation_does_not_rebuild_twice() {
        let (client, journal) = scripted_client(vec![]).await;

        client.refresh_credentials(1).await;
        client.refresh_credentials(1).await;

        assert_eq!(client.generation().await, 2);
        let connects = entries(&journal)
            .iter()
            .filter(|e| e.starts_with("connect:"))
            .count();
        assert_eq!(connects, 2);
    }

    #[tokio::test]
    async fn test_self_heals_after_out_of_band_rotation() {
        let blobs = tempfile::tempdir().unwrap();
        let secrets = tempfile::tempdir().unwrap();
        let secret_file = secrets.path().join("StorageConnectionString");
        let write_key = |key: &str| {
            std::fs::write(blobs.path().join(ACCOUNT_KEY_FILE), key).unwrap();
            std::fs::write(
                &secret_file,
                format!("BlobRoot={};AccountKey={}", blobs.path().display(), key),
            )
            .unwrap();
        };
        write_key("key-1");

        let cache = Arc::new(SecretCache::with_default_ttl(Arc::new(FileSecretProvider::new(
            secrets.path(),
        ))));
        let client = CredentialedResourceClient::connect(
            cache,
            "StorageConnectionString",
            Arc::new(FsConnector),
            RetryPolicy::fixed(3, Duration::from_millis(5)),
            Metrics::new().unwrap(),
        )
        .await
        .unwrap();

        client.upload("reports", "a.csv", b"one").await.unwrap();

        write_key("key-2");

        let locator = client.upload("reports", "b.csv", b"two").await.unwrap();
        assert!(locator.ends_with("reports/b.csv"));
        assert_eq!(client.generation().await, 2);
        assert_eq!(
            client.list("reports").await.unwrap(),
            vec!["a.csv".to_string(), "b.csv".to_string()]
        );
    }
}
