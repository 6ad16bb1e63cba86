//! Recording doubles shared by the consumer and worker tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::messaging::{
    HandlerError, InMemoryQueue, LeaseRenewal, LeasedMessage, MessageHandler, QueueTransport,
    TransportError,
};
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Receive { at: Instant, ids: Vec<String> },
    ReceiveFailed { at: Instant },
    Delete { id: String, at: Instant, accepted: bool },
    ExtendLease { id: String, at: Instant },
    DeadLetter { id: String },
}

/// [`InMemoryQueue`] wrapper that journals every transport call.
pub(crate) struct RecordingTransport {
    queue: InMemoryQueue,
    calls: Mutex<Vec<Call>>,
    pending_failures: AtomicU32,
}

impl RecordingTransport {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            queue: InMemoryQueue::new(name),
            calls: Mutex::new(Vec::new()),
            pending_failures: AtomicU32::new(0),
        })
    }

    pub(crate) fn queue(&self) -> &InMemoryQueue {
        &self.queue
    }

    pub(crate) fn fail_next_receives(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// When each receive call was made, failed or not.
    pub(crate) fn receive_times(&self) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Receive { at, .. } | Call::ReceiveFailed { at } => Some(at),
                _ => None,
            })
            .collect()
    }

    /// When the message with `id` was handed out.
    pub(crate) fn deliveries_of(&self, id: &str) -> Vec<Instant> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Receive { at, ids } if ids.iter().any(|i| i == id) => Some(at),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn accepted_deletes(&self) -> Vec<(String, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Delete {
                    id,
                    at,
                    accepted: true,
                } => Some((id, at)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl QueueTransport for RecordingTransport {
    fn queue_name(&self) -> &str {
        self.queue.queue_name()
    }

    async fn ensure_exists(&self) -> Result<(), TransportError> {
        self.queue.ensure_exists().await
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, TransportError> {
        let at = Instant::now();
        let remaining = self.pending_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pending_failures.store(remaining - 1, Ordering::SeqCst);
            self.record(Call::ReceiveFailed { at });
            return Err(TransportError::Transient("broker unreachable".into()));
        }

        let messages = self.queue.receive(max_messages, visibility_timeout).await?;
        self.record(Call::Receive {
            at,
            ids: messages.iter().map(|m| m.id.clone()).collect(),
        });
        Ok(messages)
    }

    async fn delete(&self, id: &str, receipt_token: &str) -> Result<(), TransportError> {
        let result = self.queue.delete(id, receipt_token).await;
        self.record(Call::Delete {
            id: id.to_string(),
            at: Instant::now(),
            accepted: result.is_ok(),
        });
        result
    }

    async fn extend_lease(
        &self,
        id: &str,
        receipt_token: &str,
        visibility_timeout: Duration,
    ) -> Result<LeaseRenewal, TransportError> {
        self.record(Call::ExtendLease {
            id: id.to_string(),
            at: Instant::now(),
        });
        self.queue.extend_lease(id, receipt_token, visibility_timeout).await
    }

    async fn dead_letter(&self, message: &LeasedMessage, reason: &str) -> Result<(), TransportError> {
        self.record(Call::DeadLetter {
            id: message.id.clone(),
        });
        self.queue.dead_letter(message, reason).await
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Step {
    pub(crate) succeed: bool,
    pub(crate) panics: bool,
    pub(crate) delay: Duration,
}

impl Step {
    pub(crate) fn ok() -> Self {
        Self::ok_after(Duration::ZERO)
    }

    pub(crate) fn ok_after(delay: Duration) -> Self {
        Self {
            succeed: true,
            panics: false,
            delay,
        }
    }

    pub(crate) fn fail() -> Self {
        Self {
            succeed: false,
            panics: false,
            delay: Duration::ZERO,
        }
    }

    pub(crate) fn panic() -> Self {
        Self {
            succeed: false,
            panics: true,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handled {
    pub(crate) id: String,
    pub(crate) dequeue_count: u32,
    pub(crate) finished_at: Instant,
    pub(crate) succeeded: bool,
}

/// Handler that plays back a script of outcomes, then keeps repeating the
/// fallback step.
pub(crate) struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    handled: Mutex<Vec<Handled>>,
}

impl ScriptedHandler {
    pub(crate) fn new(script: Vec<Step>) -> Arc<Self> {
        Self::with_fallback(script, Step::ok())
    }

    pub(crate) fn with_fallback(script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            handled: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn handled(&self) -> Vec<Handled> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &LeasedMessage) -> Result<(), HandlerError> {
        let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        tokio::time::sleep(step.delay).await;
        if step.panics {
            panic!("handler blew up on {}", message.body_text());
        }

        self.handled.lock().unwrap().push(Handled {
            id: message.id.clone(),
            dequeue_count: message.dequeue_count,
            finished_at: Instant::now(),
            succeeded: step.succeed,
        });

        if step.succeed {
            Ok(())
        } else {
            Err(HandlerError::Failed("scripted failure".into()))
        }
    }
}

pub(crate) fn metrics() -> Arc<Metrics> {
    Metrics::new().unwrap()
}
