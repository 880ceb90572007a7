//! Operation classification and the owned change event

use super::model::{AfterSnapshot, CdcEnvelope, Payload, RowSnapshot, SourceInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of row-level change carried by an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Row emitted by an initial snapshot
    Read,
    /// Absent or unrecognized operation code
    Unknown,
}

impl Operation {
    /// Classify a raw operation code; anything but `c`, `u`, `d`, `r` is `Unknown`
    pub fn from_code(code: Option<&str>) -> Self {
        match code {
            Some("c") => Operation::Create,
            Some("u") => Operation::Update,
            Some("d") => Operation::Delete,
            Some("r") => Operation::Read,
            _ => Operation::Unknown,
        }
    }

    /// Wire code for this operation, `None` for `Unknown`
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Operation::Create => Some("c"),
            Operation::Update => Some("u"),
            Operation::Delete => Some("d"),
            Operation::Read => Some("r"),
            Operation::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Read => "READ",
            Operation::Unknown => "UNKNOWN",
        }
    }

    /// Whether the before snapshot is relevant to this operation
    pub fn surfaces_before(&self) -> bool {
        matches!(self, Operation::Update | Operation::Delete)
    }

    /// Whether the after snapshot is relevant to this operation
    pub fn surfaces_after(&self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified change, ready for a handler
///
/// Only the snapshots relevant to the operation are surfaced: `after` for
/// create/read, `before` for delete, both for update. Unknown operations
/// surface `after` when the envelope carries one.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: Operation,
    /// Raw operation code as received, kept for unknown codes
    pub op_code: Option<String>,
    /// Source table, when the provenance block names one
    pub table: Option<String>,
    /// Event time; epoch zero when the envelope carries none
    pub occurred_at: DateTime<Utc>,
    pub before: Option<RowSnapshot>,
    pub after: Option<AfterSnapshot>,
    pub tx_id: Option<String>,
    pub source: Option<SourceInfo>,
}

impl ChangeEvent {
    /// Classify a decoded payload
    pub fn from_payload(payload: Payload) -> Self {
        let operation = Operation::from_code(payload.op.as_deref());
        let occurred_at = payload
            .ts_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let before = payload.before.filter(|_| operation.surfaces_before());
        let after = payload.after.filter(|_| operation.surfaces_after());
        let table = payload.source.as_ref().and_then(|s| s.table.clone());

        Self {
            operation,
            op_code: payload.op,
            table,
            occurred_at,
            before,
            after,
            tx_id: payload.tx_id,
            source: payload.source,
        }
    }

    /// Epoch milliseconds of `occurred_at`
    pub fn timestamp_ms(&self) -> i64 {
        self.occurred_at.timestamp_millis()
    }

    /// Customer id from whichever snapshot is surfaced, after first
    pub fn customer_id(&self) -> Option<i64> {
        self.after
            .as_ref()
            .and_then(|a| a.row.customer_id)
            .or_else(|| self.before.as_ref().and_then(|b| b.customer_id))
    }
}

impl CdcEnvelope {
    /// Classify this envelope; an envelope without a payload is an `Unknown` event
    pub fn into_change_event(self) -> ChangeEvent {
        ChangeEvent::from_payload(self.payload.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, email: &str) -> RowSnapshot {
        RowSnapshot {
            customer_id: Some(id),
            email: Some(email.to_string()),
            ..RowSnapshot::default()
        }
    }

    fn after(id: i64, email: &str) -> AfterSnapshot {
        AfterSnapshot {
            row: row(id, email),
            created_date: Some(1_000),
            modified_date: Some(2_000),
        }
    }

    fn payload(op: Option<&str>) -> Payload {
        Payload {
            op: op.map(str::to_string),
            ts_ms: Some(1_700_000_000_000),
            before: Some(row(1, "old@example.com")),
            after: Some(after(1, "new@example.com")),
            source: Some(SourceInfo {
                table: Some("Customers".to_string()),
                ..SourceInfo::default()
            }),
            tx_id: None,
        }
    }

    #[test]
    fn test_from_code() {
        assert_eq!(Operation::from_code(Some("c")), Operation::Create);
        assert_eq!(Operation::from_code(Some("u")), Operation::Update);
        assert_eq!(Operation::from_code(Some("d")), Operation::Delete);
        assert_eq!(Operation::from_code(Some("r")), Operation::Read);
        assert_eq!(Operation::from_code(Some("t")), Operation::Unknown);
        assert_eq!(Operation::from_code(Some("C")), Operation::Unknown);
        assert_eq!(Operation::from_code(None), Operation::Unknown);
    }

    #[test]
    fn test_code_round_trip() {
        for op in [
            Operation::Create,
            Operation::Update,
            Operation::Delete,
            Operation::Read,
        ] {
            assert_eq!(Operation::from_code(op.code()), op);
        }
        assert!(Operation::Unknown.code().is_none());
    }

    #[test]
    fn test_update_surfaces_both() {
        let event = ChangeEvent::from_payload(payload(Some("u")));
        assert_eq!(event.operation, Operation::Update);
        assert!(event.before.is_some());
        assert!(event.after.is_some());
        assert_eq!(event.table.as_deref(), Some("Customers"));
    }

    #[test]
    fn test_create_and_read_surface_after_only() {
        for code in ["c", "r"] {
            let event = ChangeEvent::from_payload(payload(Some(code)));
            assert!(event.before.is_none());
            assert_eq!(event.after, Some(after(1, "new@example.com")));
        }
    }

    #[test]
    fn test_delete_surfaces_before_only() {
        let event = ChangeEvent::from_payload(payload(Some("d")));
        assert_eq!(event.operation, Operation::Delete);
        assert_eq!(event.before, Some(row(1, "old@example.com")));
        assert!(event.after.is_none());
        assert_eq!(event.customer_id(), Some(1));
    }

    #[test]
    fn test_unknown_keeps_raw_code() {
        let event = ChangeEvent::from_payload(payload(Some("t")));
        assert_eq!(event.operation, Operation::Unknown);
        assert_eq!(event.op_code.as_deref(), Some("t"));
        assert!(event.before.is_none());
        assert!(event.after.is_some());
    }

    #[test]
    fn test_missing_timestamp_is_epoch() {
        let mut p = payload(Some("c"));
        p.ts_ms = None;
        let event = ChangeEvent::from_payload(p);
        assert_eq!(event.timestamp_ms(), 0);

        let event = ChangeEvent::from_payload(payload(Some("c")));
        assert_eq!(event.timestamp_ms(), 1_700_000_000_000);
    }

    #[test]
    fn test_envelope_without_payload() {
        let event = CdcEnvelope::default().into_change_event();
        assert_eq!(event.operation, Operation::Unknown);
        assert!(event.before.is_none());
        assert!(event.after.is_none());
        assert!(event.table.is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(Operation::Update.to_string(), "UPDATE");
        assert_eq!(Operation::Unknown.to_string(), "UNKNOWN");
    }
}
