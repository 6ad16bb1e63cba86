//! In-process queue with full lease semantics.
//!
//! Visibility deadlines run on tokio's clock, so tests can drive lease expiry
//! with paused time.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::transport::{LeaseRenewal, LeasedMessage, QueueTransport, TransportError};

struct StoredMessage {
    id: String,
    body: Vec<u8>,
    dequeue_count: u32,
    visible_at: Instant,
    receipt_token: Option<String>,
}

impl StoredMessage {
    fn holds_live_lease(&self, receipt_token: &str, now: Instant) -> bool {
        self.receipt_token.as_deref() == Some(receipt_token) && now < self.visible_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: String,
    pub body: Vec<u8>,
    pub dequeue_count: u32,
    pub reason: String,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    dead_letters: Vec<DeadLetter>,
}

pub struct InMemoryQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Enqueues a message, visible immediately. Returns its id.
    pub async fn send(&self, body: impl Into<Vec<u8>>) -> String {
        let id = Uuid::new_v4().to_string();
        self.state.lock().await.messages.push_back(StoredMessage {
            id: id.clone(),
            body: body.into(),
            dequeue_count: 0,
            visible_at: Instant::now(),
            receipt_token: None,
        });
        debug!(queue = %self.name, id = %id, "Message enqueued");
        id
    }

    /// Messages still on the queue, leased or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    fn lease_expired(id: &str) -> TransportError {
        TransportError::LeaseExpired { id: id.to_string() }
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self) -> Result<(), TransportError> {
        info!(queue = %self.name, "In-memory queue ready");
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, TransportError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let leased = state
            .messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .take(max_messages)
            .map(|message| {
                let receipt_token = Uuid::new_v4().to_string();
                message.dequeue_count += 1;
                message.visible_at = now + visibility_timeout;
                message.receipt_token = Some(receipt_token.clone());

                LeasedMessage {
                    id: message.id.clone(),
                    receipt_token,
                    body: message.body.clone(),
                    lease_expiry: message.visible_at,
                    dequeue_count: message.dequeue_count,
                }
            })
            .collect();

        Ok(leased)
    }

    async fn delete(&self, id: &str, receipt_token: &str) -> Result<(), TransportError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let position = state
            .messages
            .iter()
            .position(|m| m.id == id && m.holds_live_lease(receipt_token, now))
            .ok_or_else(|| Self::lease_expired(id))?;
        state.messages.remove(position);
        Ok(())
    }

    async fn extend_lease(
        &self,
        id: &str,
        receipt_token: &str,
        visibility_timeout: Duration,
    ) -> Result<LeaseRenewal, TransportError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.holds_live_lease(receipt_token, now))
            .ok_or_else(|| Self::lease_expired(id))?;

        let receipt_token = Uuid::new_v4().to_string();
        message.visible_at = now + visibility_timeout;
        message.receipt_token = Some(receipt_token.clone());

        Ok(LeaseRenewal {
            receipt_token,
            lease_expiry: message.visible_at,
        })
    }

    async fn dead_letter(&self, message: &LeasedMessage, reason: &str) -> Result<(), TransportError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let position = state
            .messages
            .iter()
            .position(|m| m.id == message.id && m.holds_live_lease(&message.receipt_token, now))
            .ok_or_else(|| Self::lease_expired(&message.id))?;

        if let Some(stored) = state.messages.remove(position) {
            state.dead_letters.push(DeadLetter {
                id: stored.id,
                body: stored.body,
                dequeue_count: stored.dequeue_count,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }
}
