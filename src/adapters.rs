//! Broker adapters implementing the capability traits.
//!
//! - `memory`: in-process log and queue broker, always available
//! - `kafka`: `rdkafka` change-log source (feature `kafka`)
//! - `amqp`: `lapin` queue publisher/consumer (feature `amqp`)

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "amqp")]
pub mod amqp;

/// Anchor a topic pattern at the start of the name
///
/// Kafka only treats a subscription as a regular expression when it starts
/// with `^`.
pub fn anchored_pattern(pattern: &str) -> String {
    if pattern.starts_with('^') {
        pattern.to_string()
    } else {
        format!("^{}", pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchored_pattern() {
        assert_eq!(anchored_pattern("sqlserver.*"), "^sqlserver.*");
        assert_eq!(anchored_pattern("^sqlserver.*"), "^sqlserver.*");
    }
}
