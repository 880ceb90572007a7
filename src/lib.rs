//! # CDC Relay
//!
//! Relays change-data-capture events from a partitioned change log (Kafka)
//! into durable queues (RabbitMQ), and consumes those queues to decode and
//! react to each event.
//!
//! ## Overview
//!
//! Two independent loops, usually run as separate processes:
//! - **Bridge**: poll the log, route the topic to a queue, publish with
//!   provenance headers, commit the offset only after the publish is confirmed
//! - **Consumer**: take one delivery at a time, decode the CDC envelope,
//!   classify the operation, hand it to an [`EventHandler`], then ack or reject
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cdc_relay::adapters::memory::{MemoryBroker, MemoryLog};
//! use cdc_relay::{BridgeRuntime, RelayConfig, RelayResult};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> RelayResult<()> {
//! let log = MemoryLog::new();
//! log.append("sqlserver.dbo.Customers", 0, br#"{"payload":{"op":"c"}}"#.to_vec());
//!
//! let token = CancellationToken::new();
//! let mut bridge = BridgeRuntime::new(log, MemoryBroker::new(), RelayConfig::default())?;
//! bridge.run(token).await
//! # }
//! ```
//!
//! ## Features
//!
//! - **At-least-once relaying**: offsets advance only past confirmed publishes;
//!   a failed publish rewinds the source
//! - **Poison message handling**: redelivery cap, then a dead-letter queue
//! - **Typed envelopes**: every optional field keeps "absent" apart from zero
//! - **Observability**: structured `tracing` records per state transition,
//!   `metrics` counters, health tracking
//! - **Broker adapters**: in-memory always; `rdkafka` and `lapin` behind the
//!   `kafka` and `amqp` features

pub mod adapters;
mod config;
pub mod envelope;
mod error;
pub mod message;
mod metrics;
mod retry;
pub mod routing;
pub mod runtime;
mod traits;
pub mod utils;

// Re-export public API
pub use config::{
    CommitPolicy, DeadLetterSettings, KafkaSettings, ProcessingSettings, RabbitMqSettings,
    RelayConfig, RetrySettings, RoutingSettings,
};
pub use envelope::{AfterSnapshot, CdcEnvelope, ChangeEvent, Operation, Payload, RowSnapshot, SourceInfo};
pub use error::{RelayError, RelayResult};
pub use message::{AckHandle, LogRecord, PublishMetadata, QueueDelivery, SourcePosition};
pub use metrics::{ProcessingTimer, RelayMetrics, RelayRole};
pub use retry::{RetryConfig, RetryStrategy};
pub use routing::{route, QueueRouter};
pub use runtime::{
    init_tracing, shutdown_on_ctrl_c, BridgeRuntime, BridgeState, ConsumerRuntime, ConsumerState,
    Disposition,
};
pub use traits::{
    EventHandler, LogEventHandler, LogSource, QueueBroker, QueueConsumer, QueuePublisher, PREFETCH,
};
pub use utils::{HealthChecker, HealthStatus};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
