//! LogRecord - records read from the change log

use std::fmt;

/// Positional identity of a record within a partitioned log
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub topic: String,
    pub partition: i32,
    /// Monotonic per partition
    pub offset: i64,
}

impl SourcePosition {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Offset the consumer group resumes from once this record is done
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// One record read from the change log
///
/// The payload is opaque to the bridge. A record without payload is a
/// tombstone and is never published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub position: SourcePosition,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker timestamp, epoch milliseconds
    pub timestamp_ms: Option<i64>,
}

impl LogRecord {
    /// Create a record with a payload
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            position: SourcePosition::new(topic, partition, offset),
            key: None,
            payload: Some(payload),
            timestamp_ms: None,
        }
    }

    /// Create a record without payload
    pub fn tombstone(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            position: SourcePosition::new(topic, partition, offset),
            key: None,
            payload: None,
            timestamp_ms: None,
        }
    }

    /// Set the record key
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the broker timestamp
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn topic(&self) -> &str {
        &self.position.topic
    }

    pub fn partition(&self) -> i32 {
        self.position.partition
    }

    pub fn offset(&self) -> i64 {
        self.position.offset
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_record_basic() {
        let record = LogRecord::new("sqlserver.dbo.Customers", 2, 41, b"{}".to_vec())
            .with_key("7")
            .with_timestamp(1_700_000_000_000);

        assert_eq!(record.topic(), "sqlserver.dbo.Customers");
        assert_eq!(record.partition(), 2);
        assert_eq!(record.offset(), 41);
        assert_eq!(record.key.as_deref(), Some(&b"7"[..]));
        assert_eq!(record.payload_len(), 2);
        assert!(!record.is_tombstone());
    }

    #[test]
    fn test_tombstone() {
        let record = LogRecord::tombstone("t", 0, 3);
        assert!(record.is_tombstone());
        assert_eq!(record.payload_len(), 0);
    }

    #[test]
    fn test_position() {
        let position = SourcePosition::new("t", 1, 9);
        assert_eq!(position.next_offset(), 10);
        assert_eq!(position.to_string(), "t[1]@9");
    }
}
