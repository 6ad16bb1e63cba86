//! Credential-aware access to blob storage.
//!
//! [`CredentialedResourceClient`] owns the live backend handle, built from a
//! secret served by [`SecretCache`](crate::secrets::SecretCache). Every
//! operation runs under a bounded retry loop; authentication failures
//! invalidate the cached secret and rebuild the handle mid-operation, so an
//! out-of-band credential rotation heals without a restart.

pub mod backend;
pub mod client;
pub mod fs;
pub mod retry;

pub use backend::{BackendConnector, ErrorClass, StorageBackend, StorageError};
pub use client::{CredentialedResourceClient, ResourceError};
pub use fs::{ConnectionString, FsBlobStore, FsConnector};
pub use retry::{classify, RetryAttempt, RetryPolicy};
