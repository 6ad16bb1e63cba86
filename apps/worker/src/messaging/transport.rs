use async_trait::async_trait;
use std::borrow::Cow;
use std::time::Duration;
use tokio::time::Instant;

/// One dequeued message, held under a lease.
///
/// The `receipt_token` proves ownership of the lease and is required to
/// delete the message or extend its lease. A message is never mutated; it is
/// either acknowledged or dropped and left to expire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedMessage {
    pub id: String,
    pub receipt_token: String,
    pub body: Vec<u8>,
    pub lease_expiry: Instant,
    /// How many times this message has been handed out, starting at 1.
    pub dequeue_count: u32,
}

impl LeasedMessage {
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// New lease terms after a successful visibility extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRenewal {
    pub receipt_token: String,
    pub lease_expiry: Instant,
}

/// Leased-receive queue primitives the consumer loop runs on.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Idempotently provisions the queue.
    async fn ensure_exists(&self) -> Result<(), TransportError>;

    /// Leases up to `max_messages` visible messages. Each stays hidden from
    /// other receivers until `visibility_timeout` elapses or it is deleted.
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, TransportError>;

    /// Permanently removes a message. Fails with
    /// [`TransportError::LeaseExpired`] when the receipt token is stale.
    async fn delete(&self, id: &str, receipt_token: &str) -> Result<(), TransportError>;

    /// Pushes the lease deadline out to now + `visibility_timeout`. The old
    /// receipt token is invalidated.
    async fn extend_lease(
        &self,
        id: &str,
        receipt_token: &str,
        visibility_timeout: Duration,
    ) -> Result<LeaseRenewal, TransportError>;

    /// Moves a leased message out of the queue into a dead letter destination.
    async fn dead_letter(&self, _message: &LeasedMessage, _reason: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("dead_letter"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transient transport error: {0}")]
    Transient(String),

    #[error("Lease expired for message {id}")]
    LeaseExpired { id: String },

    #[error("Failed to set up queue: {0}")]
    Setup(String),

    #[error("Operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    pub fn is_lease_expired(&self) -> bool {
        matches!(self, Self::LeaseExpired { .. })
    }
}
