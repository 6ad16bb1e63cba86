//! Secret lookup and time-bounded caching.
//!
//! Providers fetch a secret value by name from wherever it lives (process
//! environment, a mounted secrets directory). [`SecretCache`] sits in front
//! of a provider and serves values until their TTL elapses or they are
//! explicitly invalidated.

pub mod cache;
pub mod provider;

pub use cache::{CachedSecret, SecretCache, DEFAULT_SECRET_TTL};
pub use provider::{EnvSecretProvider, FileSecretProvider, SecretError, SecretProvider};
