//! Kafka change-log source backed by `rdkafka`.

use crate::adapters::anchored_pattern;
use crate::config::{CommitPolicy, KafkaSettings};
use crate::message::{LogRecord, SourcePosition};
use crate::traits::LogSource;
use crate::{RelayError, RelayResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pattern-subscribed Kafka consumer
///
/// Offsets are never stored automatically: only positions passed to
/// `commit` (published records and tombstones) can be committed. Synchronous
/// commits and seeks block inside librdkafka, so they run on the blocking pool.
pub struct KafkaLogSource {
    consumer: Arc<StreamConsumer>,
    commit_policy: CommitPolicy,
}

impl KafkaLogSource {
    /// Create the consumer; the broker is not contacted until `subscribe`
    pub fn new(settings: &KafkaSettings) -> RelayResult<Self> {
        let auto_commit = match settings.commit_policy {
            CommitPolicy::AfterPublish => "false",
            CommitPolicy::Periodic => "true",
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", &settings.consumer_group)
            .set("auto.offset.reset", &settings.auto_offset_reset)
            .set("enable.auto.commit", auto_commit)
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|e| RelayError::fatal_with_source("Failed to create Kafka consumer", e))?;

        info!(
            bootstrap_servers = %settings.bootstrap_servers,
            group_id = %settings.consumer_group,
            commit_policy = ?settings.commit_policy,
            "Kafka consumer created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            commit_policy: settings.commit_policy,
        })
    }

    fn position_list(position: &SourcePosition, offset: i64) -> RelayResult<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&position.topic, position.partition, Offset::Offset(offset))
            .map_err(|e| classify(e, "Invalid partition offset"))?;
        Ok(tpl)
    }
}

/// Map a client error to the relay taxonomy
///
/// Authentication, authorization and librdkafka fatal errors stop the relay;
/// everything else is treated as transient.
fn classify(err: KafkaError, context: &str) -> RelayError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::Fatal
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed,
        ) => RelayError::fatal_with_source(context, err),
        _ => RelayError::retryable_with_source(context, err),
    }
}

/// Run a blocking librdkafka call on the blocking thread pool
async fn off_runtime<T, F>(call: F) -> RelayResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| RelayError::fatal_with_source("Kafka client task panicked", e))
}

#[async_trait]
impl LogSource for KafkaLogSource {
    async fn subscribe(&mut self, pattern: &str) -> RelayResult<()> {
        let pattern = anchored_pattern(pattern);
        self.consumer
            .subscribe(&[pattern.as_str()])
            .map_err(|e| RelayError::fatal_with_source("Failed to subscribe", e))
    }

    async fn poll(&mut self, timeout: Duration) -> RelayResult<Option<LogRecord>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(classify(e, "Kafka receive failed")),
            Ok(Ok(message)) => Ok(Some(LogRecord {
                position: SourcePosition::new(
                    message.topic(),
                    message.partition(),
                    message.offset(),
                ),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
                timestamp_ms: message.timestamp().to_millis(),
            })),
        }
    }

    async fn commit(&mut self, position: &SourcePosition) -> RelayResult<()> {
        let tpl = Self::position_list(position, position.next_offset())?;

        match self.commit_policy {
            CommitPolicy::AfterPublish => {
                let consumer = Arc::clone(&self.consumer);
                off_runtime(move || consumer.commit(&tpl, CommitMode::Sync))
                    .await?
                    .map_err(|e| classify(e, "Offset commit failed"))
            }
            CommitPolicy::Periodic => self
                .consumer
                .store_offsets(&tpl)
                .map_err(|e| classify(e, "Offset store failed")),
        }
    }

    async fn rewind(&mut self, position: &SourcePosition) -> RelayResult<()> {
        debug!(
            topic = %position.topic,
            partition = position.partition,
            offset = position.offset,
            "Seeking back"
        );
        let consumer = Arc::clone(&self.consumer);
        let position = position.clone();
        off_runtime(move || {
            consumer.seek(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
                SEEK_TIMEOUT,
            )
        })
        .await?
        .map_err(|e| classify(e, "Seek failed"))
    }

    async fn close(&mut self) -> RelayResult<()> {
        self.consumer.unsubscribe();
        info!("Kafka consumer unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_call_runs_off_the_runtime() {
        let runtime_thread = std::thread::current().id();
        let blocking_thread = off_runtime(|| std::thread::current().id()).await.unwrap();
        assert_ne!(blocking_thread, runtime_thread);

        let err = off_runtime(|| -> u32 { panic!("client abort") })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
