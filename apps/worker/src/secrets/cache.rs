use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use super::provider::{SecretError, SecretProvider};

pub const DEFAULT_SECRET_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct CachedSecret {
    pub name: String,
    pub value: String,
    pub fetched_at: Instant,
    pub ttl: Duration,
}

impl CachedSecret {
    /// An entry is served up to and including `fetched_at + ttl`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.fetched_at + self.ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CachedSecret>,
    /// Bumped per name on `invalidate`.
    epochs: HashMap<String, u64>,
    /// Bumped on `clear`.
    clears: u64,
}

impl CacheState {
    fn epoch(&self, name: &str) -> (u64, u64) {
        (self.clears, self.epochs.get(name).copied().unwrap_or(0))
    }
}

/// TTL cache in front of a [`SecretProvider`].
///
/// Concurrent misses for the same name may each hit the provider. A fetch
/// that was already in flight when the name was invalidated is returned to
/// its caller but never stored. The lock is never held while the provider
/// is awaited.
pub struct SecretCache {
    provider: Arc<dyn SecretProvider>,
    state: RwLock<CacheState>,
    ttl: Duration,
}

impl SecretCache {
    pub fn new(provider: Arc<dyn SecretProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            state: RwLock::new(CacheState::default()),
            ttl,
        }
    }

    pub fn with_default_ttl(provider: Arc<dyn SecretProvider>) -> Self {
        Self::new(provider, DEFAULT_SECRET_TTL)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, name: &str) -> Result<String, SecretError> {
        let (miss_reason, epoch) = {
            let state = self.state.read().await;
            let reason = match state.entries.get(name) {
                Some(entry) if !entry.is_expired(Instant::now()) => {
                    debug!(event = "secret_cache", name, outcome = "hit", "Served secret from cache");
                    return Ok(entry.value.clone());
                }
                Some(_) => "expired",
                None => "miss",
            };
            (reason, state.epoch(name))
        };

        info!(
            event = "secret_cache",
            name,
            outcome = miss_reason,
            "Fetching secret from provider"
        );

        let value = self.provider.fetch(name).await?;

        let entry = CachedSecret {
            name: name.to_string(),
            value: value.clone(),
            fetched_at: Instant::now(),
            ttl: self.ttl,
        };
        let mut state = self.state.write().await;
        if state.epoch(name) == epoch {
            state.entries.insert(name.to_string(), entry);
        } else {
            debug!(
                event = "secret_cache",
                name,
                outcome = "stale_fetch_discarded",
                "Secret was invalidated during fetch, not caching"
            );
        }

        Ok(value)
    }

    /// Drops any cached entry for `name`; the next `get` refetches.
    pub async fn invalidate(&self, name: &str) {
        let removed = {
            let mut state = self.state.write().await;
            *state.epochs.entry(name.to_string()).or_insert(0) += 1;
            state.entries.remove(name).is_some()
        };
        info!(
            event = "secret_invalidated",
            name,
            outcome = if removed { "removed" } else { "absent" },
            "Invalidated cached secret"
        );
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let count = state.entries.len();
        state.entries.clear();
        state.clears += 1;
        info!(event = "secret_cache_cleared", count, "Cleared secret cache");
    }

    /// Whether a live (unexpired) entry exists for `name`.
    pub async fn contains(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .entries
            .get(name)
            .is_some_and(|entry| !entry.is_expired(Instant::now()))
    }
}
