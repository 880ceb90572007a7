//! Relay error taxonomy.
//!
//! Every adapter maps its client errors onto three outcomes the loops act on:
//! - `Retryable`: the bridge retries the publish or rewinds the record; the
//!   consumer requeues the delivery
//! - `Fatal`: the loop releases its adapters and the process exits non-zero
//! - `InvalidData`: the message itself is bad and counts toward the redelivery cap

use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Broker or log hiccup that leaves the session usable
    ///
    /// A publish without confirm, a coordinator moving, a dropped socket.
    #[error("Retryable error: {message}")]
    Retryable {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// The session cannot continue
    ///
    /// Rejected credentials, revoked topic or group authorization, a consumer
    /// cancelled by the broker, a rewind that did not take.
    #[error("Fatal error: {message}")]
    Fatal {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },

    /// Bytes that do not decode as a CDC envelope; kept for the dead-letter copy
    #[error("Invalid data: {message}")]
    InvalidData { message: String, payload: Vec<u8> },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Retryable { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Fatal { .. })
    }

    pub fn is_invalid_data(&self) -> bool {
        matches!(self, RelayError::InvalidData { .. })
    }

    /// Metric label for `cdc_relay_publish_failures_total` and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Retryable { .. } => "retryable",
            RelayError::Fatal { .. } => "fatal",
            RelayError::InvalidData { .. } => "invalid_data",
            RelayError::Configuration(_) => "configuration",
            RelayError::Serialization(_) => "serialization",
            RelayError::Io(_) => "io",
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        RelayError::Retryable {
            message: message.into(),
            source: None,
        }
    }

    /// Transient failure wrapping the broker client's error
    pub fn retryable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RelayError::Retryable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        RelayError::Fatal {
            message: message.into(),
            source: None,
        }
    }

    /// Session-ending failure wrapping the broker client's error
    pub fn fatal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RelayError::Fatal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Undecodable message; `payload` is the raw delivery body
    pub fn invalid_data(message: impl Into<String>, payload: Vec<u8>) -> Self {
        RelayError::InvalidData {
            message: message.into(),
            payload,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RelayError::Configuration(message.into())
    }

    /// Turn a recoverable error into a stop signal, prefixing `context`
    ///
    /// Used where carrying on could let a later commit skip a record or leave
    /// the consumer without its queues.
    pub(crate) fn into_fatal(self, context: &str) -> Self {
        if self.is_fatal() {
            return self;
        }
        RelayError::fatal(format!("{}: {}", context, self))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}
