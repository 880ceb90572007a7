//! Bridge Runtime for change log → queue relaying
//!
//! Polls the log one record at a time, routes it to its queue, publishes it
//! with provenance headers and commits its offset only after the broker
//! confirmed the publish.

use crate::message::{LogRecord, PublishMetadata, SourcePosition};
use crate::metrics::{ProcessingTimer, RelayMetrics, RelayRole};
use crate::retry::RetryStrategy;
use crate::routing::QueueRouter;
use crate::runtime::sleep_or_cancel;
use crate::traits::{LogSource, QueuePublisher};
use crate::utils::{HealthChecker, HealthStatus};
use crate::{RelayConfig, RelayError, RelayResult};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bridge loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Polling,
    Routing,
    Publishing,
    Committed,
    Failed,
    Stopped,
}

/// Runtime for the change log → queue bridge
///
/// Owns both adapters for its whole lifetime. Create with `BridgeRuntime::new()`
/// and run with `.run(token).await`.
pub struct BridgeRuntime<S: LogSource, P: QueuePublisher> {
    source: S,
    publisher: P,
    router: QueueRouter,
    config: RelayConfig,
    metrics: RelayMetrics,
    retry_strategy: RetryStrategy,
    health: HealthChecker,
    state: BridgeState,
}

impl<S: LogSource, P: QueuePublisher> BridgeRuntime<S, P> {
    /// Create a new bridge runtime
    pub fn new(source: S, publisher: P, config: RelayConfig) -> RelayResult<Self> {
        config.validate()?;

        let metrics = RelayMetrics::new(&config.relay_name, RelayRole::Bridge);
        metrics.set_health(HealthStatus::Healthy.gauge_value());

        Ok(Self {
            source,
            publisher,
            router: QueueRouter::new(&config.routing.namespace),
            retry_strategy: RetryStrategy::from_settings(&config.retry),
            health: HealthChecker::new(config.processing.failure_threshold),
            metrics,
            config,
            state: BridgeState::Idle,
        })
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn health(&self) -> HealthStatus {
        self.health.status()
    }

    /// Run until `token` is cancelled or a fatal error occurs
    ///
    /// Both adapters are closed on every exit path.
    pub async fn run(&mut self, token: CancellationToken) -> RelayResult<()> {
        info!(
            relay = %self.config.relay_name,
            pattern = %self.config.kafka.topic_pattern,
            namespace = %self.router.namespace(),
            "Starting bridge runtime"
        );

        let result = self.run_loop(&token).await;
        self.transition(BridgeState::Stopped);
        let released = self.release().await;
        self.metrics.set_health(HealthStatus::Unhealthy.gauge_value());

        match &result {
            Ok(()) => info!(relay = %self.config.relay_name, "Bridge runtime stopped"),
            Err(e) => error!(relay = %self.config.relay_name, error = %e, "Bridge runtime stopped on fatal error"),
        }

        result.and(released)
    }

    async fn run_loop(&mut self, token: &CancellationToken) -> RelayResult<()> {
        let pattern = self.config.kafka.topic_pattern.clone();
        self.source
            .subscribe(&pattern)
            .await
            .map_err(|e| e.into_fatal("Subscription failed"))?;
        info!(pattern = %pattern, "Subscribed to change log");

        let poll_timeout = Duration::from_millis(self.config.processing.poll_timeout_ms);

        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            self.transition(BridgeState::Polling);

            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                polled = self.source.poll(poll_timeout) => polled,
            };

            match polled {
                Ok(Some(record)) => self.process_record(record, token).await?,
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Poll failed");
                    self.record_failure();
                    self.failure_backoff(token).await;
                }
            }
        }
    }

    /// Drive one record through routing, publishing and committing
    async fn process_record(
        &mut self,
        record: LogRecord,
        token: &CancellationToken,
    ) -> RelayResult<()> {
        self.metrics.record_received();
        let timer = ProcessingTimer::new(self.metrics.clone());
        let LogRecord {
            position, payload, ..
        } = record;

        let Some(payload) = payload else {
            debug!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                "Skipping tombstone"
            );
            return self.commit(&position).await;
        };

        self.transition(BridgeState::Routing);
        let destination = self.router.route(&position.topic);

        if token.is_cancelled() {
            debug!(offset = position.offset, "Cancelled before publishing; record stays uncommitted");
            return Ok(());
        }
        self.transition(BridgeState::Publishing);

        let metadata = PublishMetadata::provenance(&position);
        match self
            .publish_with_retry(&destination, &payload, &metadata, token)
            .await
        {
            Ok(()) => {
                self.metrics.record_published(&destination);
                self.transition(BridgeState::Committed);
                info!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    destination = %destination,
                    bytes = payload.len(),
                    outcome = "published",
                    "Relayed record"
                );
                self.commit(&position).await?;
                self.record_success();
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) if token.is_cancelled() => {
                self.transition(BridgeState::Failed);
                info!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    destination = %destination,
                    outcome = "cancelled",
                    error = %e,
                    "Shutdown interrupted the publish; record stays uncommitted"
                );
            }
            Err(e) => {
                self.transition(BridgeState::Failed);
                self.metrics.record_publish_failure(e.kind());
                error!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    destination = %destination,
                    outcome = "failed",
                    error = %e,
                    "Failed to relay record; rewinding"
                );
                self.source
                    .rewind(&position)
                    .await
                    .map_err(|e| e.into_fatal("Rewind failed"))?;
                self.record_failure();
                self.failure_backoff(token).await;
            }
        }

        timer.stop();
        Ok(())
    }

    async fn publish_with_retry(
        &mut self,
        destination: &str,
        payload: &[u8],
        metadata: &PublishMetadata,
        token: &CancellationToken,
    ) -> RelayResult<()> {
        let mut attempt = 0;

        loop {
            let attempted = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(RelayError::retryable(format!(
                        "Publish to '{}' interrupted by shutdown",
                        destination
                    )));
                }
                result = publish_once(&mut self.publisher, destination, payload, metadata) => result,
            };

            match attempted {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && self.retry_strategy.should_retry(attempt) => {
                    attempt += 1;
                    self.metrics.record_retry();

                    let backoff = self.retry_strategy.calculate_backoff(attempt);
                    warn!(
                        destination,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );

                    if !sleep_or_cancel(backoff, token).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Commit a finished record; only fatal commit errors stop the bridge
    async fn commit(&mut self, position: &SourcePosition) -> RelayResult<()> {
        match self.source.commit(position).await {
            Ok(()) => {
                self.metrics.record_committed();
                debug!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    "Offset committed"
                );
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.metrics.record_commit_failure();
                warn!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    error = %e,
                    "Offset commit failed; record may be relayed again after a restart"
                );
                Ok(())
            }
        }
    }

    async fn failure_backoff(&self, token: &CancellationToken) {
        let failures = u32::try_from(self.health.consecutive_failures()).unwrap_or(u32::MAX);
        let backoff = self.retry_strategy.calculate_backoff(failures);
        sleep_or_cancel(backoff, token).await;
    }

    fn record_success(&mut self) {
        let recovering = !self.health.is_healthy();
        let status = self.health.record_success();
        self.metrics.set_health(status.gauge_value());

        if recovering {
            info!(
                status = status.as_str(),
                since_last_failure_ms = ?self.health.time_since_last_failure().map(|d| d.as_millis() as u64),
                "Bridge recovered"
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
                "Bridge is unhealthy"
            );
        }
    }

    fn transition(&mut self, next: BridgeState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Bridge state transition");
            self.state = next;
        }
    }

    async fn release(&mut self) -> RelayResult<()> {
        let source = self.source.close().await;
        if let Err(e) = &source {
            warn!(error = %e, "Failed to close log source");
        }

        let publisher = self.publisher.close().await;
        if let Err(e) = &publisher {
            warn!(error = %e, "Failed to close queue publisher");
        }

        source.and(publisher)
    }
}

async fn publish_once<P: QueuePublisher>(
    publisher: &mut P,
    destination: &str,
    payload: &[u8],
    metadata: &PublishMetadata,
) -> RelayResult<()> {
    publisher.ensure_destination(destination).await?;
    publisher.publish(destination, payload, metadata).await
}
