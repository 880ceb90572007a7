//! Capability trait definitions.
//!
//! This module defines the seams between the relay runtimes and the brokers:
//! - `LogSource`: pattern-subscribed, partitioned change log (Kafka)
//! - `QueueBroker`: shared queue declaration and teardown
//! - `QueuePublisher`: durable, confirmed publishing (RabbitMQ)
//! - `QueueConsumer`: prefetch-1 consumption with manual acknowledgment (RabbitMQ)
//! - `EventHandler`: reaction to a classified change event

use crate::envelope::ChangeEvent;
use crate::message::{AckHandle, LogRecord, PublishMetadata, QueueDelivery, SourcePosition};
use crate::RelayResult;
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

/// Maximum number of unacknowledged deliveries a consumer holds at once
pub const PREFETCH: u16 = 1;

/// Partitioned change log read by the bridge
///
/// # Errors
///
/// Return `RelayError::Retryable` for transient failures (the loop keeps polling)
/// Return `RelayError::Fatal` when the subscription is lost (the loop stops)
#[async_trait]
pub trait LogSource: Send {
    /// Subscribe to every topic whose name matches `pattern`
    async fn subscribe(&mut self, pattern: &str) -> RelayResult<()>;

    /// Wait at most `timeout` for the next record
    ///
    /// `Ok(None)` means nothing arrived in time. Must be cancel-safe: the
    /// runtime drops the future when shutdown is requested.
    async fn poll(&mut self, timeout: Duration) -> RelayResult<Option<LogRecord>>;

    /// Mark `position` as fully processed
    ///
    /// Only called after the record was durably published (or is a tombstone).
    async fn commit(&mut self, position: &SourcePosition) -> RelayResult<()>;

    /// Make the next poll of this partition return `position` again
    async fn rewind(&mut self, position: &SourcePosition) -> RelayResult<()>;

    /// Unsubscribe and release the client
    async fn close(&mut self) -> RelayResult<()> {
        Ok(())
    }
}

/// Queue broker session shared by publishers and consumers
#[async_trait]
pub trait QueueBroker: Send {
    /// Declare a durable queue; declaring an existing queue is a no-op
    async fn ensure_destination(&mut self, name: &str) -> RelayResult<()>;

    /// Close the channel and connection
    async fn close(&mut self) -> RelayResult<()> {
        Ok(())
    }
}

/// Durable publishing side of the queue broker
#[async_trait]
pub trait QueuePublisher: QueueBroker {
    /// Publish `payload` to `destination`
    ///
    /// Returns only once the broker confirmed the message. An unconfirmed or
    /// failed publish is an error, never a partial success.
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        metadata: &PublishMetadata,
    ) -> RelayResult<()>;
}

/// Consuming side of the queue broker
///
/// At most [`PREFETCH`] delivery is outstanding: `recv` does not hand out a
/// second delivery before the first was acked or nacked.
#[async_trait]
pub trait QueueConsumer: QueueBroker {
    /// Start consuming `queue`
    async fn consume(&mut self, queue: &str) -> RelayResult<()>;

    /// Wait for the next delivery; `Ok(None)` means the broker closed the stream
    ///
    /// Must be cancel-safe.
    async fn recv(&mut self) -> RelayResult<Option<QueueDelivery>>;

    /// Acknowledge a delivery
    async fn ack(&mut self, handle: AckHandle) -> RelayResult<()>;

    /// Reject a delivery, optionally putting it back on the queue
    async fn nack(&mut self, handle: AckHandle, requeue: bool) -> RelayResult<()>;
}

/// Reaction to a classified change event
///
/// # Return Value
///
/// - `Ok(())`: the delivery is acknowledged
/// - `Err(RelayError::Fatal)`: the consumer stops
/// - any other error: the delivery is rejected and counted towards the redelivery cap
#[async_trait]
pub trait EventHandler: Send {
    async fn handle(&mut self, event: &ChangeEvent) -> RelayResult<()>;
}

/// Handler that writes each change event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventHandler;

#[async_trait]
impl EventHandler for LogEventHandler {
    async fn handle(&mut self, event: &ChangeEvent) -> RelayResult<()> {
        info!(
            operation = %event.operation,
            table = event.table.as_deref().unwrap_or("-"),
            occurred_at = %event.occurred_at.to_rfc3339(),
            customer_id = ?event.customer_id(),
            "CDC event"
        );

        if let Some(before) = &event.before {
            info!(
                customer_id = ?before.customer_id,
                name = before.full_name().as_deref().unwrap_or("-"),
                email = before.email.as_deref().unwrap_or("-"),
                phone = before.phone_number.as_deref().unwrap_or("-"),
                "Before"
            );
        }

        if let Some(after) = &event.after {
            info!(
                customer_id = ?after.row.customer_id,
                name = after.row.full_name().as_deref().unwrap_or("-"),
                email = after.row.email.as_deref().unwrap_or("-"),
                phone = after.row.phone_number.as_deref().unwrap_or("-"),
                created_date = ?after.created_date,
                modified_date = ?after.modified_date,
                "After"
            );
        }

        Ok(())
    }
}
