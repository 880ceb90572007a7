//! Topic to queue naming rule.
//!
//! The destination queue is the final dot-separated segment of the topic,
//! lower-cased, behind a namespace token: `sqlserver.dbo.Customers` becomes
//! `cdc.customers`. The rule is pure and total.

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "cdc";

/// Maps change-log topics to queue names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRouter {
    namespace: String,
}

impl QueueRouter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Destination queue for `topic`
    pub fn route(&self, topic: &str) -> String {
        let table = topic.rsplit('.').next().unwrap_or(topic);
        format!("{}.{}", self.namespace, table.to_lowercase())
    }
}

impl Default for QueueRouter {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

/// Route with the default namespace
pub fn route(topic: &str) -> String {
    QueueRouter::default().route(topic)
}
