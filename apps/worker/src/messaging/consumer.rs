use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::handler::{HandlerError, MessageHandler};
use super::transport::{LeasedMessage, QueueTransport};
use crate::metrics::Metrics;
use crate::worker::ShutdownSignal;

pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub visibility_timeout: Duration,
    pub idle_delay: Duration,
    /// Upper bound for the backoff after consecutive receive failures.
    pub max_poll_backoff: Duration,
    /// Dead-letter a message once it has been delivered more than this many
    /// times. `None` redelivers forever.
    pub max_delivery_attempts: Option<u32>,
    /// Extend the lease this often while the handler runs.
    pub lease_renewal_interval: Option<Duration>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            idle_delay: DEFAULT_IDLE_DELAY,
            max_poll_backoff: DEFAULT_MAX_POLL_BACKOFF,
            max_delivery_attempts: None,
            lease_renewal_interval: None,
        }
    }
}

/// Sequential poll/process loop with at-least-once delivery.
///
/// A message is deleted only after its handler returns `Ok`. Failed messages
/// are left leased and come back once the visibility timeout passes.
pub struct ConsumerLoop {
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
    metrics: Arc<Metrics>,
}

impl ConsumerLoop {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            handler,
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn queue(&self) -> &str {
        self.transport.queue_name()
    }

    /// Runs until `shutdown` fires. Waiting on the queue and idling are
    /// cancelled by the signal; a message already being processed is always
    /// finished first.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(
            event = "consumer_started",
            queue = %self.queue(),
            visibility_timeout_secs = self.settings.visibility_timeout.as_secs(),
            idle_delay_ms = self.settings.idle_delay.as_millis() as u64,
            "Starting consumer loop"
        );
        self.metrics.active_consumers.inc();

        let mut consecutive_errors: u32 = 0;

        'polling: while !shutdown.is_triggered() {
            let received = tokio::select! {
                biased;
                _ = shutdown.triggered() => {
                    debug!(event = "poll_cancelled", queue = %self.queue(), "Shutdown while polling");
                    break 'polling;
                }
                result = self.transport.receive(1, self.settings.visibility_timeout) => result,
            };

            match received {
                Ok(messages) if messages.is_empty() => {
                    consecutive_errors = 0;
                    if shutdown.sleep(self.settings.idle_delay).await {
                        break 'polling;
                    }
                }
                Ok(messages) => {
                    consecutive_errors = 0;
                    for message in messages {
                        self.process_message(message).await;
                        if shutdown.is_triggered() {
                            break 'polling;
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = self.poll_backoff(consecutive_errors);
                    self.metrics.poll_errors_total.inc();
                    warn!(
                        event = "poll_failed",
                        queue = %self.queue(),
                        attempt = consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Failed to receive from queue"
                    );
                    if shutdown.sleep(backoff).await {
                        break 'polling;
                    }
                }
            }
        }

        self.metrics.active_consumers.dec();
        info!(event = "consumer_stopped", queue = %self.queue(), "Consumer loop stopped");
    }

    fn poll_backoff(&self, consecutive_errors: u32) -> Duration {
        let factor = 2u32.saturating_pow(consecutive_errors.saturating_sub(1));
        self.settings
            .idle_delay
            .saturating_mul(factor)
            .min(self.settings.max_poll_backoff)
    }

    async fn process_message(&self, message: LeasedMessage) {
        if let Some(max) = self.settings.max_delivery_attempts {
            if message.dequeue_count > max {
                self.dead_letter(&message, max).await;
                return;
            }
        }

        info!(
            event = "message_received",
            queue = %self.queue(),
            id = %message.id,
            attempt = message.dequeue_count,
            payload_size = message.body.len(),
            "Processing message"
        );

        let started = Instant::now();
        let (result, receipt_token) = self.run_handler(&message).await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                info!(
                    event = "message_handled",
                    id = %message.id,
                    attempt = message.dequeue_count,
                    outcome = "success",
                    duration_ms = duration * 1000.0,
                    "Message processed successfully"
                );
                self.metrics
                    .messages_processed_total
                    .with_label_values(&[self.queue()])
                    .inc();
                self.metrics
                    .message_processing_duration_seconds
                    .with_label_values(&[self.queue(), "success"])
                    .observe(duration);

                self.acknowledge(&message.id, &receipt_token).await;
            }
            Err(err) => {
                error!(
                    event = "message_handled",
                    id = %message.id,
                    attempt = message.dequeue_count,
                    outcome = "failure",
                    error_type = err.error_type(),
                    error = %err,
                    duration_ms = duration * 1000.0,
                    "Handler failed, message left for redelivery"
                );
                self.metrics
                    .messages_failed_total
                    .with_label_values(&[self.queue(), err.error_type()])
                    .inc();
                self.metrics
                    .message_processing_duration_seconds
                    .with_label_values(&[self.queue(), "failure"])
                    .observe(duration);
            }
        }
    }

    /// Invokes the handler, renewing the lease on the side when configured.
    /// Returns the receipt token that is current once the handler is done.
    async fn run_handler(&self, message: &LeasedMessage) -> (Result<(), HandlerError>, String) {
        let mut receipt_token = message.receipt_token.clone();

        let Some(every) = self
            .settings
            .lease_renewal_interval
            .filter(|every| !every.is_zero())
        else {
            return (self.invoke_handler(message).await, receipt_token);
        };

        let handling = self.invoke_handler(message);
        tokio::pin!(handling);

        let mut renewals = tokio::time::interval_at(Instant::now() + every, every);
        renewals.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renewing = true;

        let result = loop {
            tokio::select! {
                result = &mut handling => break result,
                _ = renewals.tick(), if renewing => {
                    let renewed = self
                        .transport
                        .extend_lease(&message.id, &receipt_token, self.settings.visibility_timeout)
                        .await;
                    match renewed {
                        Ok(renewal) => {
                            debug!(event = "lease_renewed", id = %message.id, "Lease extended");
                            receipt_token = renewal.receipt_token;
                        }
                        Err(e) => {
                            warn!(
                                event = "lease_renewal_failed",
                                id = %message.id,
                                error = %e,
                                "Could not extend lease"
                            );
                            renewing = !e.is_lease_expired();
                        }
                    }
                }
            }
        };

        (result, receipt_token)
    }

    /// A panicking handler counts as a failed attempt.
    async fn invoke_handler(&self, message: &LeasedMessage) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.handler.handle(message)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
        }
    }

    async fn acknowledge(&self, id: &str, receipt_token: &str) {
        match self.transport.delete(id, receipt_token).await {
            Ok(()) => {
                debug!(event = "message_deleted", id = %id, "Message acknowledged");
            }
            Err(e) if e.is_lease_expired() => {
                self.metrics.lease_expired_total.inc();
                warn!(
                    event = "lease_expired",
                    id = %id,
                    "Lease expired before delete, message will be redelivered"
                );
            }
            Err(e) => {
                error!(event = "delete_failed", id = %id, error = %e, "Failed to delete message");
            }
        }
    }

    async fn dead_letter(&self, message: &LeasedMessage, max: u32) {
        let reason = format!("exceeded {max} delivery attempts");
        match self.transport.dead_letter(message, &reason).await {
            Ok(()) => {
                self.metrics.messages_dead_lettered_total.inc();
                warn!(
                    event = "message_dead_lettered",
                    id = %message.id,
                    attempt = message.dequeue_count,
                    reason = %reason,
                    "Message moved to dead letter destination"
                );
            }
            Err(e) => {
                error!(
                    event = "dead_letter_failed",
                    id = %message.id,
                    attempt = message.dequeue_count,
                    error = %e,
                    "Failed to dead-letter message"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
