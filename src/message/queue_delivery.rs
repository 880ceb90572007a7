//! QueueDelivery - messages handed out by the queue broker

use super::SourcePosition;
use std::collections::BTreeMap;
use std::fmt;

/// Well-known header names
pub mod headers {
    /// Origin topic of a relayed message
    pub const KAFKA_TOPIC: &str = "kafka-topic";
    /// Origin partition of a relayed message
    pub const KAFKA_PARTITION: &str = "kafka-partition";
    /// Origin offset of a relayed message
    pub const KAFKA_OFFSET: &str = "kafka-offset";
    /// Broker-maintained redelivery count (quorum queues)
    pub const DELIVERY_COUNT: &str = "x-delivery-count";
    pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
    pub const ORIGINAL_QUEUE: &str = "x-original-queue";
    pub const DELIVERY_ATTEMPTS: &str = "x-delivery-attempts";
}

/// Content type of relayed CDC envelopes
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header value; the broker header table is reduced to strings and integers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            HeaderValue::Int(_) => None,
        }
    }

    /// Integer view; numeric strings are accepted too
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Str(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            HeaderValue::Int(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value.into())
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(value.into())
    }
}

/// Ordered header table
pub type Headers = BTreeMap<String, HeaderValue>;

/// Headers and delivery flags for an outgoing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMetadata {
    pub headers: Headers,
    /// Ask the broker to write the message to disk
    pub persistent: bool,
    pub content_type: Option<String>,
}

impl Default for PublishMetadata {
    fn default() -> Self {
        Self {
            headers: Headers::new(),
            persistent: true,
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
        }
    }
}

impl PublishMetadata {
    /// Provenance headers for a record relayed from the change log
    pub fn provenance(position: &SourcePosition) -> Self {
        Self::default()
            .with_header(headers::KAFKA_TOPIC, position.topic.as_str())
            .with_header(headers::KAFKA_PARTITION, position.partition)
            .with_header(headers::KAFKA_OFFSET, position.offset)
    }

    /// Metadata for a poison message moved to a dead-letter queue
    ///
    /// The original headers are carried over so provenance survives.
    pub fn dead_letter(
        original_headers: &Headers,
        original_queue: &str,
        reason: &str,
        attempts: u32,
    ) -> Self {
        let mut metadata = Self {
            headers: original_headers.clone(),
            ..Self::default()
        };
        metadata.headers.remove(headers::DELIVERY_COUNT);
        metadata
            .with_header(headers::DEAD_LETTER_REASON, reason)
            .with_header(headers::ORIGINAL_QUEUE, original_queue)
            .with_header(headers::DELIVERY_ATTEMPTS, attempts)
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }
}

/// Single-use acknowledgment handle for a queue delivery
///
/// Not `Clone`: `ack`/`nack` take it by value, so a delivery can be
/// disposed of exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct AckHandle {
    tag: u64,
}

impl AckHandle {
    pub fn new(tag: u64) -> Self {
        Self { tag }
    }

    /// Broker delivery tag
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

/// One message handed out by the queue broker
#[derive(Debug)]
pub struct QueueDelivery {
    pub queue: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// Broker flag: the message was delivered before and not acknowledged
    pub redelivered: bool,
    pub handle: AckHandle,
}

impl QueueDelivery {
    pub fn new(queue: impl Into<String>, payload: Vec<u8>, handle: AckHandle) -> Self {
        Self {
            queue: queue.into(),
            payload,
            headers: Headers::new(),
            redelivered: false,
            handle,
        }
    }

    /// Set the header table
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Mark as redelivered
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Broker-reported number of earlier deliveries, when the queue tracks it
    pub fn delivery_count(&self) -> Option<u32> {
        self.headers
            .get(headers::DELIVERY_COUNT)
            .and_then(HeaderValue::as_i64)
            .and_then(|count| u32::try_from(count).ok())
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_headers() {
        let metadata =
            PublishMetadata::provenance(&SourcePosition::new("sqlserver.dbo.Customers", 3, 17));

        assert!(metadata.persistent);
        assert_eq!(metadata.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(
            metadata.header(headers::KAFKA_TOPIC),
            Some(&HeaderValue::Str("sqlserver.dbo.Customers".to_string()))
        );
        assert_eq!(
            metadata.header(headers::KAFKA_PARTITION),
            Some(&HeaderValue::Int(3))
        );
        assert_eq!(
            metadata.header(headers::KAFKA_OFFSET),
            Some(&HeaderValue::Int(17))
        );
    }

    #[test]
    fn test_dead_letter_headers() {
        let mut original = Headers::new();
        original.insert(headers::KAFKA_OFFSET.to_string(), HeaderValue::Int(5));
        original.insert(headers::DELIVERY_COUNT.to_string(), HeaderValue::Int(4));

        let metadata =
            PublishMetadata::dead_letter(&original, "cdc.customers", "malformed envelope", 4);

        assert_eq!(
            metadata.header(headers::KAFKA_OFFSET),
            Some(&HeaderValue::Int(5))
        );
        assert!(metadata.header(headers::DELIVERY_COUNT).is_none());
        assert_eq!(
            metadata
                .header(headers::ORIGINAL_QUEUE)
                .and_then(HeaderValue::as_str),
            Some("cdc.customers")
        );
        assert_eq!(
            metadata
                .header(headers::DELIVERY_ATTEMPTS)
                .and_then(HeaderValue::as_i64),
            Some(4)
        );
    }

    #[test]
    fn test_delivery_count() {
        let delivery = QueueDelivery::new("q", vec![], AckHandle::new(1));
        assert!(delivery.delivery_count().is_none());

        let mut table = Headers::new();
        table.insert(headers::DELIVERY_COUNT.to_string(), HeaderValue::Int(2));
        let delivery = QueueDelivery::new("q", vec![], AckHandle::new(2)).with_headers(table);
        assert_eq!(delivery.delivery_count(), Some(2));

        let mut table = Headers::new();
        table.insert(headers::DELIVERY_COUNT.to_string(), HeaderValue::Int(-1));
        let delivery = QueueDelivery::new("q", vec![], AckHandle::new(3)).with_headers(table);
        assert!(delivery.delivery_count().is_none());
    }

    #[test]
    fn test_header_value_views() {
        assert_eq!(HeaderValue::from("12").as_i64(), Some(12));
        assert_eq!(HeaderValue::from(7_i64).as_str(), None);
        assert_eq!(HeaderValue::from(7_i32).to_string(), "7");
    }
}
