//! Consumer Runtime for queue → handler processing
//!
//! Takes one delivery at a time from the queue (prefetch 1), decodes it as a
//! CDC envelope, classifies it and hands the change event to an
//! [`EventHandler`]. Failed deliveries are requeued up to the redelivery cap,
//! then moved to the dead-letter queue.

use crate::envelope::{CdcEnvelope, Operation, Payload};
use crate::message::{AckHandle, Headers, PublishMetadata, QueueDelivery};
use crate::metrics::{ProcessingTimer, RelayMetrics, RelayRole};
use crate::retry::RetryStrategy;
use crate::runtime::{sleep_or_cancel, RedeliveryTracker};
use crate::traits::{EventHandler, QueueConsumer, QueuePublisher, PREFETCH};
use crate::utils::{HealthChecker, HealthStatus};
use crate::{RelayConfig, RelayError, RelayResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Waiting,
    Decoding,
    Classifying,
    Acked,
    Rejected,
    Stopped,
}

/// Terminal disposition of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Rejected and put back on the queue
    Requeued,
    /// Copied to the dead-letter queue, then rejected without requeue
    DeadLettered,
    /// Rejected without requeue and not kept anywhere
    Discarded,
}

/// Runtime for the queue consumer
///
/// The broker handle serves both as consumer and as dead-letter publisher.
pub struct ConsumerRuntime<Q: QueueConsumer + QueuePublisher, H: EventHandler> {
    broker: Q,
    handler: H,
    queue: String,
    dead_letter_queue: Option<String>,
    config: RelayConfig,
    metrics: RelayMetrics,
    retry_strategy: RetryStrategy,
    health: HealthChecker,
    redelivery: RedeliveryTracker,
    state: ConsumerState,
}

impl<Q: QueueConsumer + QueuePublisher, H: EventHandler> ConsumerRuntime<Q, H> {
    /// Create a consumer runtime for `config.rabbitmq.queue_name`
    pub fn new(broker: Q, handler: H, config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;

        let queue = config.rabbitmq.queue_name.clone();
        let dead_letter_queue = config.dead_letter.queue_for(&queue);
        let metrics = RelayMetrics::new(&config.relay_name, RelayRole::Consumer);
        metrics.set_health(HealthStatus::Healthy.gauge_value());

        Ok(Self {
            broker,
            handler,
            queue,
            dead_letter_queue,
            retry_strategy: RetryStrategy::from_settings(&config.retry),
            health: HealthChecker::new(config.processing.failure_threshold),
            redelivery: RedeliveryTracker::default(),
            metrics,
            config,
            state: ConsumerState::Waiting,
        })
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn health(&self) -> HealthStatus {
        self.health.status()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn dead_letter_queue(&self) -> Option<&str> {
        self.dead_letter_queue.as_deref()
    }

    /// Run until `token` is cancelled or a fatal error occurs
    ///
    /// The broker handle is closed on every exit path.
    pub async fn run(&mut self, token: CancellationToken) -> RelayResult<()> {
        info!(
            relay = %self.config.relay_name,
            queue = %self.queue,
            dead_letter_queue = ?self.dead_letter_queue,
            "Starting consumer runtime"
        );

        let result = self.run_loop(&token).await;
        self.transition(ConsumerState::Stopped);

        let released = self.broker.close().await;
        if let Err(e) = &released {
            warn!(error = %e, "Failed to close queue consumer");
        }
        self.metrics.set_health(HealthStatus::Unhealthy.gauge_value());

        match &result {
            Ok(()) => info!(relay = %self.config.relay_name, "Consumer runtime stopped"),
            Err(e) => error!(relay = %self.config.relay_name, error = %e, "Consumer runtime stopped on fatal error"),
        }

        result.and(released)
    }

    async fn run_loop(&mut self, token: &CancellationToken) -> RelayResult<()> {
        let queue = self.queue.clone();
        self.broker
            .ensure_destination(&queue)
            .await
            .map_err(|e| e.into_fatal("Failed to declare queue"))?;

        if let Some(dlq) = self.dead_letter_queue.clone() {
            self.broker
                .ensure_destination(&dlq)
                .await
                .map_err(|e| e.into_fatal("Failed to declare dead-letter queue"))?;
        }

        self.broker
            .consume(&queue)
            .await
            .map_err(|e| e.into_fatal("Failed to start consuming"))?;
        info!(queue = %queue, prefetch = PREFETCH, "Waiting for CDC events");

        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            self.transition(ConsumerState::Waiting);

            let received = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                received = self.broker.recv() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    self.process_delivery(delivery).await?;
                }
                Ok(None) => {
                    return Err(RelayError::fatal(format!(
                        "Consumer stream for queue '{}' was closed by the broker",
                        queue
                    )));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Receive failed");
                    self.record_failure();
                    let failures =
                        u32::try_from(self.health.consecutive_failures()).unwrap_or(u32::MAX);
                    sleep_or_cancel(self.retry_strategy.calculate_backoff(failures), token).await;
                }
            }
        }
    }

    /// Decode, classify and dispose of one delivery
    ///
    /// Returns the disposition applied; only fatal errors are returned as `Err`.
    pub async fn process_delivery(&mut self, delivery: QueueDelivery) -> RelayResult<Disposition> {
        self.metrics.record_received();
        let timer = ProcessingTimer::new(self.metrics.clone());

        let broker_count = delivery.delivery_count();
        let QueueDelivery {
            payload,
            headers,
            redelivered,
            handle,
            ..
        } = delivery;

        self.transition(ConsumerState::Decoding);
        debug!(
            queue = %self.queue,
            bytes = payload.len(),
            redelivered,
            delivery_count = ?broker_count,
            "Received delivery"
        );

        let disposition = match self.decode_and_handle(&payload).await {
            Ok(operation) => {
                self.dispose(handle, None).await?;
                self.transition(ConsumerState::Acked);
                self.metrics.record_acked(operation);
                self.redelivery.forget(&payload);
                self.record_success();
                debug!(queue = %self.queue, operation = %operation, outcome = "acked", "Delivery acknowledged");
                Disposition::Acked
            }
            Err(e) if e.is_fatal() => {
                self.dispose(handle, Some(true)).await?;
                self.transition(ConsumerState::Rejected);
                return Err(e);
            }
            Err(e) => self.reject(payload, headers, handle, broker_count, e).await?,
        };

        timer.stop();
        Ok(disposition)
    }

    async fn decode_and_handle(&mut self, payload: &[u8]) -> RelayResult<Operation> {
        let envelope = CdcEnvelope::from_slice(payload)?;

        self.transition(ConsumerState::Classifying);
        if let Some(violation) = envelope.payload.as_ref().and_then(Payload::shape_violation) {
            warn!(
                queue = %self.queue,
                op = ?envelope.payload.as_ref().and_then(|p| p.op.as_deref()),
                violation,
                "Envelope shape does not match its operation"
            );
        }

        let event = envelope.into_change_event();
        debug!(
            operation = %event.operation,
            table = ?event.table,
            has_before = event.before.is_some(),
            has_after = event.after.is_some(),
            "Classified change event"
        );

        self.handler.handle(&event).await?;
        Ok(event.operation)
    }

    /// Apply the redelivery cap to a failed delivery
    async fn reject(
        &mut self,
        payload: Vec<u8>,
        headers: Headers,
        handle: AckHandle,
        broker_count: Option<u32>,
        error: RelayError,
    ) -> RelayResult<Disposition> {
        self.record_failure();

        let attempts = match broker_count {
            Some(previous) => previous.saturating_add(1),
            None => self.redelivery.record_failure(&payload),
        };
        let max_redeliveries = self.config.dead_letter.max_redeliveries;

        if attempts <= max_redeliveries {
            warn!(
                queue = %self.queue,
                attempts,
                max_redeliveries,
                error = %error,
                outcome = "requeued",
                "Rejecting delivery for redelivery"
            );
            return self.requeue(handle).await;
        }

        let Some(dlq) = self.dead_letter_queue.clone() else {
            error!(
                queue = %self.queue,
                attempts,
                bytes = payload.len(),
                error = %error,
                outcome = "discarded",
                "Discarding poison message; dead-lettering is disabled"
            );
            self.dispose(handle, Some(false)).await?;
            self.transition(ConsumerState::Rejected);
            self.metrics.record_rejected(false);
            self.redelivery.forget(&payload);
            return Ok(Disposition::Discarded);
        };

        let metadata =
            PublishMetadata::dead_letter(&headers, &self.queue, &error.to_string(), attempts);

        match self.broker.publish(&dlq, &payload, &metadata).await {
            Ok(()) => {
                self.dispose(handle, Some(false)).await?;
                self.transition(ConsumerState::Rejected);
                self.metrics.record_rejected(false);
                self.metrics.record_dead_lettered();
                self.redelivery.forget(&payload);
                error!(
                    queue = %self.queue,
                    dead_letter_queue = %dlq,
                    attempts,
                    error = %error,
                    outcome = "dead_lettered",
                    "Moved poison message to dead-letter queue"
                );
                Ok(Disposition::DeadLettered)
            }
            Err(publish_error) if publish_error.is_fatal() => {
                self.dispose(handle, Some(true)).await?;
                self.transition(ConsumerState::Rejected);
                Err(publish_error)
            }
            Err(publish_error) => {
                warn!(
                    queue = %self.queue,
                    dead_letter_queue = %dlq,
                    error = %publish_error,
                    "Dead-letter publish failed; requeueing"
                );
                self.requeue(handle).await
            }
        }
    }

    async fn requeue(&mut self, handle: AckHandle) -> RelayResult<Disposition> {
        self.dispose(handle, Some(true)).await?;
        self.transition(ConsumerState::Rejected);
        self.metrics.record_rejected(true);
        Ok(Disposition::Requeued)
    }

    /// Ack (`None`) or nack with the given requeue flag
    ///
    /// A failed non-fatal disposition is logged: the broker redelivers the
    /// message once the channel recovers.
    async fn dispose(&mut self, handle: AckHandle, nack_requeue: Option<bool>) -> RelayResult<()> {
        let tag = handle.tag();
        let result = match nack_requeue {
            None => self.broker.ack(handle).await,
            Some(requeue) => self.broker.nack(handle, requeue).await,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(queue = %self.queue, delivery_tag = tag, error = %e, "Failed to settle delivery");
                Ok(())
            }
        }
    }

    fn record_success(&mut self) {
        let recovering = !self.health.is_healthy();
        let status = self.health.record_success();
        self.metrics.set_health(status.gauge_value());

        if recovering {
            info!(
                status = status.as_str(),
                since_last_failure_ms = ?self.health.time_since_last_failure().map(|d| d.as_millis() as u64),
                "Consumer recovered"
            );
        }
    }

    fn record_failure(&mut self) {
        let previous = self.health.status();
        let status = self.health.record_failure();
        self.metrics.set_health(status.gauge_value());

        if status == HealthStatus::Unhealthy && previous != HealthStatus::Unhealthy {
            error!(
                status = status.as_str(),
                consecutive_failures = self.health.consecutive_failures(),
                since_last_success_ms = ?self.health.time_since_last_success().map(|d| d.as_millis() as u64),
                "Consumer is unhealthy"
            );
        }
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Consumer state transition");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBroker;
    use crate::traits::LogEventHandler;

    #[test]
    fn test_dead_letter_queue_name() {
        let runtime =
            ConsumerRuntime::new(MemoryBroker::new(), LogEventHandler, RelayConfig::default())
                .unwrap();
        assert_eq!(runtime.queue(), "cdc.customers");
        assert_eq!(runtime.dead_letter_queue(), Some("cdc.customers.dlq"));
        assert_eq!(runtime.state(), ConsumerState::Waiting);
    }

    #[test]
    fn test_dead_letter_disabled() {
        let mut config = RelayConfig::default();
        config.dead_letter.enabled = false;

        let runtime = ConsumerRuntime::new(MemoryBroker::new(), LogEventHandler, config).unwrap();
        assert!(runtime.dead_letter_queue().is_none());
    }

    #[tokio::test]
    async fn test_closed_stream_is_fatal() {
        let broker = MemoryBroker::new();
        broker.close_stream();

        let mut runtime =
            ConsumerRuntime::new(broker.clone(), LogEventHandler, RelayConfig::default()).unwrap();
        let err = runtime.run(CancellationToken::new()).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(runtime.state(), ConsumerState::Stopped);
        assert!(broker.is_closed());
    }
}
