//! Transport-level records.
//!
//! This module provides the delivery units that move through the two loops:
//! - `LogRecord`: one record read from the partitioned change log
//! - `QueueDelivery`: one message handed out by the queue broker, with its ack handle
//! - `PublishMetadata`: headers and delivery flags attached to an outgoing message

mod log_record;
mod queue_delivery;

pub use log_record::{LogRecord, SourcePosition};
pub use queue_delivery::{
    headers, AckHandle, HeaderValue, Headers, PublishMetadata, QueueDelivery, JSON_CONTENT_TYPE,
};
