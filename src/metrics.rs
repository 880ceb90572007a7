//! Metrics and observability for the relay loops.
//!
//! Only the `metrics` facade is used; installing a recorder/exporter is up
//! to the host process.

use crate::envelope::Operation;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;
use std::time::{Duration, Instant};

static DESCRIBE: Once = Once::new();

/// Which loop a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    Bridge,
    Consumer,
}

impl RelayRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayRole::Bridge => "bridge",
            RelayRole::Consumer => "consumer",
        }
    }
}

/// Metrics collector for one relay loop
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    /// Relay name for labeling
    relay_name: String,
    role: RelayRole,
}

impl RelayMetrics {
    pub fn new(relay_name: impl Into<String>, role: RelayRole) -> Self {
        DESCRIBE.call_once(Self::register_metrics);

        Self {
            relay_name: relay_name.into(),
            role,
        }
    }

    pub fn role(&self) -> RelayRole {
        self.role
    }

    /// Register metric descriptions
    fn register_metrics() {
        // Counters
        describe_counter!(
            "cdc_relay_messages_received_total",
            "Total number of records or deliveries received"
        );
        describe_counter!(
            "cdc_relay_messages_published_total",
            "Total number of messages confirmed by the queue broker"
        );
        describe_counter!(
            "cdc_relay_publish_failures_total",
            "Total number of publishes that failed after retries"
        );
        describe_counter!(
            "cdc_relay_publish_retries_total",
            "Total number of publish retry attempts"
        );
        describe_counter!(
            "cdc_relay_offsets_committed_total",
            "Total number of source offsets committed"
        );
        describe_counter!(
            "cdc_relay_commit_failures_total",
            "Total number of failed offset commits"
        );
        describe_counter!(
            "cdc_relay_events_acked_total",
            "Total number of change events acknowledged"
        );
        describe_counter!(
            "cdc_relay_events_rejected_total",
            "Total number of deliveries rejected"
        );
        describe_counter!(
            "cdc_relay_events_dead_lettered_total",
            "Total number of deliveries moved to a dead-letter queue"
        );

        // Histograms
        describe_histogram!(
            "cdc_relay_processing_duration_seconds",
            "Time spent on each record or delivery"
        );

        // Gauges
        describe_gauge!(
            "cdc_relay_inflight_messages",
            "Current number of records or deliveries being processed"
        );
        describe_gauge!(
            "cdc_relay_health",
            "Relay health status (1 = healthy, 0.5 = degraded, 0 = unhealthy)"
        );
    }

    /// Record a record or delivery received
    pub fn record_received(&self) {
        counter!(
            "cdc_relay_messages_received_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .increment(1);
    }

    /// Record a confirmed publish
    pub fn record_published(&self, destination: &str) {
        counter!(
            "cdc_relay_messages_published_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
            "destination" => destination.to_string(),
        )
        .increment(1);
    }

    /// Record a publish that gave up
    pub fn record_publish_failure(&self, error_kind: &str) {
        counter!(
            "cdc_relay_publish_failures_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
            "error_type" => error_kind.to_string(),
        )
        .increment(1);
    }

    /// Record a retry attempt
    pub fn record_retry(&self) {
        counter!(
            "cdc_relay_publish_retries_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .increment(1);
    }

    pub fn record_committed(&self) {
        counter!(
            "cdc_relay_offsets_committed_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .increment(1);
    }

    pub fn record_commit_failure(&self) {
        counter!(
            "cdc_relay_commit_failures_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .increment(1);
    }

    /// Record an acknowledged change event
    pub fn record_acked(&self, operation: Operation) {
        counter!(
            "cdc_relay_events_acked_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
            "operation" => operation.as_str(),
        )
        .increment(1);
    }

    /// Record a rejected delivery
    pub fn record_rejected(&self, requeue: bool) {
        counter!(
            "cdc_relay_events_rejected_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
            "requeue" => if requeue { "true" } else { "false" },
        )
        .increment(1);
    }

    pub fn record_dead_lettered(&self) {
        counter!(
            "cdc_relay_events_dead_lettered_total",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .increment(1);
    }

    /// Record processing duration
    pub fn record_processing_time(&self, duration: Duration) {
        histogram!(
            "cdc_relay_processing_duration_seconds",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .record(duration.as_secs_f64());
    }

    /// Increment inflight message count
    pub fn increment_inflight(&self) {
        gauge!(
            "cdc_relay_inflight_messages",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .increment(1.0);
    }

    /// Decrement inflight message count
    pub fn decrement_inflight(&self) {
        gauge!(
            "cdc_relay_inflight_messages",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .decrement(1.0);
    }

    /// Set relay health status
    pub fn set_health(&self, value: f64) {
        gauge!(
            "cdc_relay_health",
            "relay" => self.relay_name.clone(),
            "role" => self.role.as_str(),
        )
        .set(value);
    }
}

/// Timer for tracking processing duration
///
/// Increments the inflight gauge on creation and decrements it exactly once
/// when dropped, whether or not `stop` was called.
pub struct ProcessingTimer {
    start: Instant,
    metrics: RelayMetrics,
}

impl ProcessingTimer {
    pub fn new(metrics: RelayMetrics) -> Self {
        metrics.increment_inflight();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        self.metrics.record_processing_time(duration);
        duration
    }
}

impl Drop for ProcessingTimer {
    fn drop(&mut self) {
        self.metrics.decrement_inflight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = RelayMetrics::new("test-relay", RelayRole::Bridge);
        assert_eq!(metrics.relay_name, "test-relay");
        assert_eq!(metrics.role().as_str(), "bridge");
        assert_eq!(RelayRole::Consumer.as_str(), "consumer");
    }

    #[test]
    fn test_timer() {
        let metrics = RelayMetrics::new("test-relay", RelayRole::Consumer);

        let timer = ProcessingTimer::new(metrics.clone());
        std::thread::sleep(Duration::from_millis(10));
        let elapsed = timer.stop();
        assert!(elapsed >= Duration::from_millis(10));

        // Dropped without stop: still balances the gauge, no panic without a recorder
        let _timer = ProcessingTimer::new(metrics);
    }
}
