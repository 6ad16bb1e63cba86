//! Leased receive on top of RabbitMQ.
//!
//! AMQP has no visibility timeout, so the transport emulates one: every
//! `basic_get` delivery is tracked with a deadline, and deliveries whose
//! deadline has passed are nacked back onto the queue on the next receive.
//! Acknowledging requires the delivery to still be under a live lease.

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{LeaseRenewal, LeasedMessage, QueueTransport, TransportError};

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const ERROR_REASON_HEADER: &str = "x-error-reason";
const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
const DEQUEUE_COUNT_HEADER: &str = "x-dequeue-count";

struct Lease {
    token: String,
    expires_at: Instant,
}

pub struct RabbitMqTransport {
    channel: Channel,
    queue_name: String,
    dead_letter_queue: String,
    leases: Mutex<HashMap<u64, Lease>>,
}

impl RabbitMqTransport {
    pub fn new(channel: Channel, queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        let dead_letter_queue = format!("{}.dlq", queue_name);
        Self {
            channel,
            queue_name,
            dead_letter_queue,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Lease>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns deliveries whose lease ran out to the queue.
    async fn requeue_expired(&self) -> Result<(), TransportError> {
        let now = Instant::now();
        let expired: Vec<u64> = {
            let mut leases = self.leases();
            let tags: Vec<u64> = leases
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in &tags {
                leases.remove(tag);
            }
            tags
        };

        for delivery_tag in expired {
            self.channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await
                .map_err(transient)?;
            debug!(event = "lease_reclaimed", delivery_tag, "Expired lease returned to queue");
        }
        Ok(())
    }

    /// Resolves a receipt to its delivery tag if the lease is still live.
    /// With `release` the lease is dropped from tracking.
    fn live_lease(&self, id: &str, receipt_token: &str, release: bool) -> Result<u64, TransportError> {
        let expired = || TransportError::LeaseExpired { id: id.to_string() };
        let (delivery_tag, token) = parse_receipt(receipt_token).ok_or_else(expired)?;

        let mut leases = self.leases();
        let live = leases
            .get(&delivery_tag)
            .is_some_and(|lease| lease.token == token && Instant::now() < lease.expires_at);
        if !live {
            return Err(expired());
        }
        if release {
            leases.remove(&delivery_tag);
        }
        Ok(delivery_tag)
    }

    async fn declare(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Setup(format!("{}: {}", name, e)))?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for RabbitMqTransport {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn ensure_exists(&self) -> Result<(), TransportError> {
        self.declare(&self.queue_name).await?;
        self.declare(&self.dead_letter_queue).await?;

        info!(
            queue = %self.queue_name,
            dlq = %self.dead_letter_queue,
            "Queue topology configured"
        );
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<LeasedMessage>, TransportError> {
        self.requeue_expired().await?;

        let mut messages = Vec::new();
        while messages.len() < max_messages {
            let fetched = self
                .channel
                .basic_get(&self.queue_name, BasicGetOptions { no_ack: false })
                .await
                .map_err(transient)?;

            let Some(got) = fetched else {
                break;
            };
            let mut delivery = got.delivery;

            let token = Uuid::new_v4().to_string();
            let lease_expiry = Instant::now() + visibility_timeout;
            self.leases().insert(
                delivery.delivery_tag,
                Lease {
                    token: token.clone(),
                    expires_at: lease_expiry,
                },
            );

            let id = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            messages.push(LeasedMessage {
                id,
                receipt_token: receipt(delivery.delivery_tag, &token),
                dequeue_count: dequeue_count(&delivery.properties, delivery.redelivered),
                body: std::mem::take(&mut delivery.data),
                lease_expiry,
            });
        }

        Ok(messages)
    }

    async fn delete(&self, id: &str, receipt_token: &str) -> Result<(), TransportError> {
        let delivery_tag = self.live_lease(id, receipt_token, true)?;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(transient)?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        id: &str,
        receipt_token: &str,
        visibility_timeout: Duration,
    ) -> Result<LeaseRenewal, TransportError> {
        let delivery_tag = self.live_lease(id, receipt_token, false)?;

        let token = Uuid::new_v4().to_string();
        let lease_expiry = Instant::now() + visibility_timeout;
        self.leases().insert(
            delivery_tag,
            Lease {
                token: token.clone(),
                expires_at: lease_expiry,
            },
        );

        Ok(LeaseRenewal {
            receipt_token: receipt(delivery_tag, &token),
            lease_expiry,
        })
    }

    async fn dead_letter(&self, message: &LeasedMessage, reason: &str) -> Result<(), TransportError> {
        self.live_lease(&message.id, &message.receipt_token, false)?;

        let mut headers = FieldTable::default();
        headers.insert(
            ERROR_REASON_HEADER.into(),
            AMQPValue::LongString(reason.into()),
        );
        headers.insert(
            ORIGINAL_QUEUE_HEADER.into(),
            AMQPValue::LongString(self.queue_name.clone().into()),
        );
        headers.insert(
            DEQUEUE_COUNT_HEADER.into(),
            AMQPValue::LongUInt(message.dequeue_count),
        );

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let properties = BasicProperties::default()
            .with_message_id(message.id.clone().into())
            .with_headers(headers)
            .with_delivery_mode(2)
            .with_timestamp(timestamp);

        self.channel
            .basic_publish(
                "",
                &self.dead_letter_queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(transient)?
            .await
            .map_err(transient)?;

        let delivery_tag = self.live_lease(&message.id, &message.receipt_token, true)?;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(transient)?;

        warn!(
            id = %message.id,
            dlq = %self.dead_letter_queue,
            reason,
            "Message republished to DLQ"
        );
        Ok(())
    }
}

fn transient(e: lapin::Error) -> TransportError {
    TransportError::Transient(e.to_string())
}

fn receipt(delivery_tag: u64, token: &str) -> String {
    format!("{}.{}", delivery_tag, token)
}

fn parse_receipt(receipt: &str) -> Option<(u64, &str)> {
    let (tag, token) = receipt.split_once('.')?;
    Some((tag.parse().ok()?, token))
}

/// Deliveries so far, counting this one. Quorum queues report prior
/// deliveries in `x-delivery-count`; classic queues only flag redelivery.
fn dequeue_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    let previous = properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(DELIVERY_COUNT_HEADER))
        .and_then(|value| match value {
            AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
            AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            _ => None,
        });

    match previous {
        Some(previous) => previous.saturating_add(1),
        None if redelivered => 2,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_delivery_count(value: AMQPValue) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(DELIVERY_COUNT_HEADER.into(), value);
        BasicProperties::default().with_headers(headers)
    }

    #[test]
    fn test_receipt_round_trip() {
        let token = "5f0c-token";
        assert_eq!(parse_receipt(&receipt(42, token)), Some((42, token)));
        assert_eq!(parse_receipt("garbage"), None);
        assert_eq!(parse_receipt("x.token"), None);
    }

    #[test]
    fn test_dequeue_count_from_header() {
        let properties = with_delivery_count(AMQPValue::LongLongInt(2));
        assert_eq!(dequeue_count(&properties, true), 3);

        let properties = with_delivery_count(AMQPValue::LongInt(-1));
        assert_eq!(dequeue_count(&properties, false), 1);
    }

    #[test]
    fn test_dequeue_count_without_header() {
        let properties = BasicProperties::default();
        assert_eq!(dequeue_count(&properties, false), 1);
        assert_eq!(dequeue_count(&properties, true), 2);
    }
}
