//! In-process adapters.
//!
//! `MemoryLog` is a partitioned, regex-subscribed change log and
//! `MemoryBroker` a durable queue broker with prefetch-1 delivery. Both are
//! cheap cloneable handles over shared state, so a test keeps one clone for
//! inspection while the runtime owns the other. Failures can be injected at
//! every operation.

use crate::adapters::anchored_pattern;
use crate::message::{
    headers, AckHandle, HeaderValue, LogRecord, PublishMetadata, QueueDelivery, SourcePosition,
};
use crate::traits::{LogSource, QueueBroker, QueueConsumer, QueuePublisher};
use crate::{RelayError, RelayResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

type PartitionKey = (String, i32);

#[derive(Default)]
struct LogState {
    /// topic → partitions → records (payload or tombstone)
    topics: BTreeMap<String, Vec<Vec<Option<Vec<u8>>>>>,
    subscription: Option<Regex>,
    /// Next offset to hand out per partition
    fetch: HashMap<PartitionKey, i64>,
    /// Committed resume offset per partition
    committed: HashMap<PartitionKey, i64>,
    rewinds: Vec<SourcePosition>,
    subscribe_errors: VecDeque<RelayError>,
    poll_errors: VecDeque<RelayError>,
    commit_errors: VecDeque<RelayError>,
    rewind_errors: VecDeque<RelayError>,
    polls: usize,
    closed: bool,
}

impl LogState {
    fn next_record(&mut self) -> Option<LogRecord> {
        let subscription = self.subscription.as_ref()?;

        for (topic, partitions) in &self.topics {
            if !subscription.is_match(topic) {
                continue;
            }
            for (partition, records) in partitions.iter().enumerate() {
                let partition = partition as i32;
                let key = (topic.clone(), partition);
                let offset = *self.fetch.get(&key).unwrap_or(&0);

                if let Some(payload) = usize::try_from(offset).ok().and_then(|i| records.get(i)) {
                    let record = LogRecord {
                        position: SourcePosition::new(topic.clone(), partition, offset),
                        key: None,
                        payload: payload.clone(),
                        timestamp_ms: None,
                    };
                    self.fetch.insert(key, offset + 1);
                    return Some(record);
                }
            }
        }
        None
    }
}

/// In-memory partitioned change log
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; partitions are created on demand
    pub fn append(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> SourcePosition {
        self.push(topic, partition, Some(payload.into()))
    }

    /// Append a record without payload
    pub fn append_tombstone(&self, topic: &str, partition: i32) -> SourcePosition {
        self.push(topic, partition, None)
    }

    fn push(&self, topic: &str, partition: i32, payload: Option<Vec<u8>>) -> SourcePosition {
        let position = {
            let mut state = self.inner.lock();
            let partitions = state.topics.entry(topic.to_string()).or_default();
            let index = usize::try_from(partition).unwrap_or(0);
            if partitions.len() <= index {
                partitions.resize_with(index + 1, Vec::new);
            }
            let records = &mut partitions[index];
            records.push(payload);
            SourcePosition::new(topic, partition, records.len() as i64 - 1)
        };
        self.notify.notify_one();
        position
    }

    pub fn fail_next_subscribe(&self, error: RelayError) {
        self.inner.lock().subscribe_errors.push_back(error);
    }

    pub fn fail_next_poll(&self, error: RelayError) {
        self.inner.lock().poll_errors.push_back(error);
        self.notify.notify_one();
    }

    pub fn fail_next_commit(&self, error: RelayError) {
        self.inner.lock().commit_errors.push_back(error);
    }

    pub fn fail_next_rewind(&self, error: RelayError) {
        self.inner.lock().rewind_errors.push_back(error);
    }

    /// Committed resume offset (last processed offset + 1)
    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .lock()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Every position the consumer was rewound to, in order
    pub fn rewinds(&self) -> Vec<SourcePosition> {
        self.inner.lock().rewinds.clone()
    }

    /// Number of completed poll calls
    pub fn poll_count(&self) -> usize {
        self.inner.lock().polls
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.lock().subscription.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[async_trait]
impl LogSource for MemoryLog {
    async fn subscribe(&mut self, pattern: &str) -> RelayResult<()> {
        let mut state = self.inner.lock();
        if let Some(error) = state.subscribe_errors.pop_front() {
            return Err(error);
        }

        let regex = Regex::new(&anchored_pattern(pattern)).map_err(|e| {
            RelayError::config(format!("Invalid topic pattern '{}': {}", pattern, e))
        })?;
        state.subscription = Some(regex);
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> RelayResult<Option<LogRecord>> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(RelayError::fatal("Log source is closed"));
                }
                if let Some(error) = state.poll_errors.pop_front() {
                    state.polls += 1;
                    return Err(error);
                }
                if let Some(record) = state.next_record() {
                    state.polls += 1;
                    return Ok(Some(record));
                }
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                self.inner.lock().polls += 1;
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, position: &SourcePosition) -> RelayResult<()> {
        let mut state = self.inner.lock();
        if let Some(error) = state.commit_errors.pop_front() {
            return Err(error);
        }
        state.committed.insert(
            (position.topic.clone(), position.partition),
            position.next_offset(),
        );
        Ok(())
    }

    async fn rewind(&mut self, position: &SourcePosition) -> RelayResult<()> {
        let mut state = self.inner.lock();
        if let Some(error) = state.rewind_errors.pop_front() {
            return Err(error);
        }
        state
            .fetch
            .insert((position.topic.clone(), position.partition), position.offset);
        state.rewinds.push(position.clone());
        Ok(())
    }

    async fn close(&mut self) -> RelayResult<()> {
        let mut state = self.inner.lock();
        state.subscription = None;
        state.closed = true;
        Ok(())
    }
}

struct StoredMessage {
    payload: Vec<u8>,
    metadata: PublishMetadata,
    /// Times the message was handed out and rejected with requeue
    requeues: u32,
}

struct Outstanding {
    tag: u64,
    queue: String,
    message: StoredMessage,
}

/// A message as it was published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub destination: String,
    pub payload: Vec<u8>,
    pub metadata: PublishMetadata,
}

/// A recorded rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackRecord {
    pub payload: Vec<u8>,
    pub requeue: bool,
}

#[derive(Default)]
struct BrokerState {
    queues: BTreeMap<String, VecDeque<StoredMessage>>,
    declarations: HashMap<String, usize>,
    published: Vec<PublishedMessage>,
    consuming: Option<String>,
    outstanding: Option<Outstanding>,
    next_tag: u64,
    acked: Vec<Vec<u8>>,
    nacks: Vec<NackRecord>,
    publish_errors: VecDeque<RelayError>,
    stream_closed: bool,
    closed: bool,
}

/// In-memory queue broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message on `queue` directly, declaring the queue if needed
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.enqueue_with(queue, payload, PublishMetadata::default());
    }

    /// Put a message with explicit metadata on `queue`
    pub fn enqueue_with(&self, queue: &str, payload: impl Into<Vec<u8>>, metadata: PublishMetadata) {
        {
            let mut state = self.inner.lock();
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(StoredMessage {
                    payload: payload.into(),
                    metadata,
                    requeues: 0,
                });
        }
        self.notify.notify_one();
    }

    /// Make the next `count` publishes fail with a retryable error
    pub fn fail_next_publishes(&self, count: usize) {
        let mut state = self.inner.lock();
        for _ in 0..count {
            state
                .publish_errors
                .push_back(RelayError::retryable("publish was not confirmed"));
        }
    }

    /// Make the next publish fail with `error`
    pub fn fail_next_publish(&self, error: RelayError) {
        self.inner.lock().publish_errors.push_back(error);
    }

    /// End the consumer stream, as a broker-side cancel would
    pub fn close_stream(&self) {
        self.inner.lock().stream_closed = true;
        self.notify.notify_one();
    }

    /// Every confirmed publish, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().published.clone()
    }

    pub fn published_to(&self, destination: &str) -> Vec<PublishedMessage> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| m.destination == destination)
            .cloned()
            .collect()
    }

    /// Messages waiting on `queue`, not counting one handed out
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.lock().queues.keys().cloned().collect()
    }

    /// Number of `ensure_destination` calls for `queue`
    pub fn declaration_count(&self, queue: &str) -> usize {
        self.inner.lock().declarations.get(queue).copied().unwrap_or(0)
    }

    /// Payloads acknowledged so far
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.inner.lock().acked.clone()
    }

    pub fn nacks(&self) -> Vec<NackRecord> {
        self.inner.lock().nacks.clone()
    }

    /// Whether a delivery is handed out and not yet settled
    pub fn has_outstanding(&self) -> bool {
        self.inner.lock().outstanding.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn settle(&self, handle: AckHandle) -> RelayResult<Outstanding> {
        let mut state = self.inner.lock();
        match state.outstanding.take() {
            Some(outstanding) if outstanding.tag == handle.tag() => Ok(outstanding),
            other => {
                state.outstanding = other;
                Err(RelayError::fatal(format!(
                    "Unknown delivery tag {}",
                    handle.tag()
                )))
            }
        }
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn ensure_destination(&mut self, name: &str) -> RelayResult<()> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(RelayError::fatal("Broker connection is closed"));
        }
        state.queues.entry(name.to_string()).or_default();
        *state.declarations.entry(name.to_string()).or_default() += 1;
        Ok(())
    }

    async fn close(&mut self) -> RelayResult<()> {
        let mut state = self.inner.lock();
        state.closed = true;
        state.consuming = None;
        // Unsettled deliveries go back to their queue, as on a channel close
        if let Some(outstanding) = state.outstanding.take() {
            if let Some(queue) = state.queues.get_mut(&outstanding.queue) {
                queue.push_front(outstanding.message);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueuePublisher for MemoryBroker {
    async fn publish(
        &mut self,
        destination: &str,
        payload: &[u8],
        metadata: &PublishMetadata,
    ) -> RelayResult<()> {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(RelayError::fatal("Broker connection is closed"));
            }
            if let Some(error) = state.publish_errors.pop_front() {
                return Err(error);
            }

            let Some(queue) = state.queues.get_mut(destination) else {
                return Err(RelayError::retryable(format!(
                    "No queue named '{}'",
                    destination
                )));
            };
            queue.push_back(StoredMessage {
                payload: payload.to_vec(),
                metadata: metadata.clone(),
                requeues: 0,
            });
            state.published.push(PublishedMessage {
                destination: destination.to_string(),
                payload: payload.to_vec(),
                metadata: metadata.clone(),
            });
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for MemoryBroker {
    async fn consume(&mut self, queue: &str) -> RelayResult<()> {
        let mut state = self.inner.lock();
        if !state.queues.contains_key(queue) {
            return Err(RelayError::fatal(format!("No queue named '{}'", queue)));
        }
        state.consuming = Some(queue.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> RelayResult<Option<QueueDelivery>> {
        loop {
            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(RelayError::fatal("Broker connection is closed"));
                }
                if state.stream_closed {
                    return Ok(None);
                }
                let Some(queue) = state.consuming.clone() else {
                    return Err(RelayError::fatal("recv called before consume"));
                };

                if state.outstanding.is_none() {
                    let next = state.queues.get_mut(&queue).and_then(VecDeque::pop_front);
                    if let Some(message) = next {
                        state.next_tag += 1;
                        let tag = state.next_tag;

                        let mut table = message.metadata.headers.clone();
                        if message.requeues > 0 {
                            table.insert(
                                headers::DELIVERY_COUNT.to_string(),
                                HeaderValue::from(message.requeues),
                            );
                        }
                        let delivery =
                            QueueDelivery::new(queue.clone(), message.payload.clone(), AckHandle::new(tag))
                                .with_headers(table)
                                .with_redelivered(message.requeues > 0);

                        state.outstanding = Some(Outstanding {
                            tag,
                            queue,
                            message,
                        });
                        return Ok(Some(delivery));
                    }
                }
            }

            self.notify.notified().await;
        }
    }

    async fn ack(&mut self, handle: AckHandle) -> RelayResult<()> {
        let outstanding = self.settle(handle)?;
        self.inner.lock().acked.push(outstanding.message.payload);
        self.notify.notify_one();
        Ok(())
    }

    async fn nack(&mut self, handle: AckHandle, requeue: bool) -> RelayResult<()> {
        let Outstanding {
            queue, mut message, ..
        } = self.settle(handle)?;

        {
            let mut state = self.inner.lock();
            state.nacks.push(NackRecord {
                payload: message.payload.clone(),
                requeue,
            });
            if requeue {
                message.requeues += 1;
                state.queues.entry(queue).or_default().push_front(message);
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_poll_in_order_and_timeout() {
        let mut log = MemoryLog::new();
        log.append("sqlserver.dbo.Customers", 0, b"a".to_vec());
        log.append("sqlserver.dbo.Customers", 0, b"b".to_vec());
        log.append("other.topic", 0, b"x".to_vec());
        log.subscribe("sqlserver.*").await.unwrap();

        let first = log.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.offset(), 0);
        assert_eq!(first.payload.as_deref(), Some(&b"a"[..]));

        let second = log.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.offset(), 1);

        assert!(log.poll(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_rewind_and_commit() {
        let mut log = MemoryLog::new();
        log.append("t", 0, b"a".to_vec());
        log.subscribe("t").await.unwrap();

        let record = log.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        log.rewind(&record.position).await.unwrap();
        let again = log.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.position, record.position);

        log.commit(&again.position).await.unwrap();
        assert_eq!(log.committed_offset("t", 0), Some(1));
        assert_eq!(log.rewinds(), vec![record.position]);
    }

    #[tokio::test]
    async fn test_log_wakes_on_append() {
        let mut log = MemoryLog::new();
        log.subscribe("t").await.unwrap();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("t", 0, b"late".to_vec());
        });

        let record = log.poll(Duration::from_secs(5)).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn test_broker_declare_is_idempotent() {
        let mut broker = MemoryBroker::new();
        broker.ensure_destination("cdc.customers").await.unwrap();
        broker.ensure_destination("cdc.customers").await.unwrap();

        assert_eq!(broker.queue_names(), vec!["cdc.customers".to_string()]);
        assert_eq!(broker.declaration_count("cdc.customers"), 2);
    }

    #[tokio::test]
    async fn test_broker_publish_requires_queue() {
        let mut broker = MemoryBroker::new();
        let err = broker
            .publish("missing", b"x", &PublishMetadata::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_broker_prefetch_one_and_requeue() {
        let mut broker = MemoryBroker::new();
        broker.enqueue("q", b"first".to_vec());
        broker.enqueue("q", b"second".to_vec());
        broker.consume("q").await.unwrap();

        let delivery = broker.recv().await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"first");
        assert!(!delivery.redelivered);

        // Second delivery is held back until the first is settled
        let blocked = tokio::time::timeout(Duration::from_millis(20), broker.recv()).await;
        assert!(blocked.is_err());

        broker.nack(delivery.handle, true).await.unwrap();
        let again = broker.recv().await.unwrap().unwrap();
        assert_eq!(again.payload, b"first");
        assert!(again.redelivered);
        assert_eq!(again.delivery_count(), Some(1));

        broker.ack(again.handle).await.unwrap();
        let next = broker.recv().await.unwrap().unwrap();
        assert_eq!(next.payload, b"second");
        assert_eq!(broker.acked(), vec![b"first".to_vec()]);
    }

    #[tokio::test]
    async fn test_broker_unknown_tag_is_fatal() {
        let mut broker = MemoryBroker::new();
        broker.enqueue("q", b"x".to_vec());
        broker.consume("q").await.unwrap();
        let _delivery = broker.recv().await.unwrap().unwrap();

        let err = broker.ack(AckHandle::new(99)).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(broker.has_outstanding());
    }
}
