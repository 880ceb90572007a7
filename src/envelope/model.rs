//! Typed envelope structures

use crate::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One CDC event as it travels on the queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CdcEnvelope {
    /// Opaque schema descriptor, carried but never interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl CdcEnvelope {
    /// Decode an envelope from raw message bytes
    ///
    /// Malformed input is reported as [`RelayError::InvalidData`] carrying the bytes.
    pub fn from_slice(bytes: &[u8]) -> RelayResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            RelayError::invalid_data(format!("Malformed CDC envelope: {}", e), bytes.to_vec())
        })
    }

    /// Encode the envelope as compact JSON
    pub fn to_vec(&self) -> RelayResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// The change itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Raw operation code (`c`, `u`, `d`, `r`); unknown codes are preserved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,

    /// Event time, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<RowSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<AfterSnapshot>,

    /// Provenance block, used for observability only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

impl Payload {
    /// Describe how the snapshots deviate from what the operation implies
    ///
    /// Returns `None` when the shape matches (or the operation is unknown).
    /// Deviations are tolerated by the consumer, only reported.
    pub fn shape_violation(&self) -> Option<&'static str> {
        use super::Operation;

        let has_before = self.before.is_some();
        let has_after = self.after.is_some();

        match Operation::from_code(self.op.as_deref()) {
            Operation::Create if has_before => Some("create event carries a before snapshot"),
            Operation::Create if !has_after => Some("create event is missing its after snapshot"),
            Operation::Delete if has_after => Some("delete event carries an after snapshot"),
            Operation::Delete if !has_before => Some("delete event is missing its before snapshot"),
            Operation::Update if !(has_before && has_after) => {
                Some("update event is missing a before or after snapshot")
            }
            Operation::Read if has_before => Some("snapshot read carries a before snapshot"),
            Operation::Read if !has_after => Some("snapshot read is missing its after snapshot"),
            _ => None,
        }
    }
}

/// Row image shared by the before and after positions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

impl RowSnapshot {
    /// First and last name joined by a space, skipping absent parts
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Row image after the change: the shared row fields plus audit timestamps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AfterSnapshot {
    #[serde(flatten)]
    pub row: RowSnapshot,

    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<i64>,

    /// Epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date: Option<i64>,
}

impl AfterSnapshot {
    pub fn row(&self) -> &RowSnapshot {
        &self.row
    }
}

/// Connector provenance block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector: Option<String>,

    /// Logical server name of the connector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_ms: Option<i64>,

    /// `"true"`, `"false"` or `"last"` while snapshotting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_lsn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_lsn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_serial_no: Option<i64>,
}

impl SourceInfo {
    /// Whether the event was produced by an initial snapshot
    pub fn is_snapshot(&self) -> bool {
        matches!(self.snapshot.as_deref(), Some("true") | Some("last"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_nulls_as_absent() {
        let bytes = serde_json::to_vec(&json!({
            "schema": null,
            "payload": {
                "op": "c",
                "before": null,
                "after": { "customer_id": 1, "first_name": "Ada" },
                "source": null
            }
        }))
        .unwrap();

        let envelope = CdcEnvelope::from_slice(&bytes).unwrap();
        assert!(envelope.schema.is_none());

        let payload = envelope.payload.unwrap();
        assert_eq!(payload.op.as_deref(), Some("c"));
        assert!(payload.before.is_none());
        assert!(payload.source.is_none());
        assert!(payload.ts_ms.is_none());

        let after = payload.after.unwrap();
        assert_eq!(after.row.customer_id, Some(1));
        assert_eq!(after.row.first_name.as_deref(), Some("Ada"));
        assert!(after.row.last_name.is_none());
        assert!(after.created_date.is_none());
    }

    #[test]
    fn test_schema_object_is_opaque() {
        let bytes = br#"{"schema":{"type":"struct","optional":false},"payload":{"op":"r"}}"#;
        let envelope = CdcEnvelope::from_slice(bytes).unwrap();
        assert_eq!(
            envelope.schema,
            Some(json!({"type": "struct", "optional": false}))
        );
    }

    #[test]
    fn test_malformed_bytes_are_invalid_data() {
        let err = CdcEnvelope::from_slice(b"{not json").unwrap_err();
        assert!(err.is_invalid_data());

        match err {
            RelayError::InvalidData { payload, .. } => assert_eq!(payload, b"{not json"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_after_snapshot_flattens_row_fields() {
        let after = AfterSnapshot {
            row: RowSnapshot {
                customer_id: Some(5),
                email: Some("a@example.com".to_string()),
                ..RowSnapshot::default()
            },
            created_date: Some(1_700_000_000_000),
            modified_date: None,
        };

        let value = serde_json::to_value(&after).unwrap();
        assert_eq!(
            value,
            json!({
                "customer_id": 5,
                "email": "a@example.com",
                "created_date": 1_700_000_000_000_i64
            })
        );
    }

    #[test]
    fn test_full_name() {
        let row = RowSnapshot {
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            ..RowSnapshot::default()
        };
        assert_eq!(row.full_name().as_deref(), Some("Ada Lovelace"));

        let last_only = RowSnapshot {
            last_name: Some("Hopper".to_string()),
            ..RowSnapshot::default()
        };
        assert_eq!(last_only.full_name().as_deref(), Some("Hopper"));

        assert!(RowSnapshot::default().full_name().is_none());
    }

    #[test]
    fn test_shape_violation() {
        let create = Payload {
            op: Some("c".to_string()),
            after: Some(AfterSnapshot::default()),
            ..Payload::default()
        };
        assert!(create.shape_violation().is_none());

        let create_with_before = Payload {
            before: Some(RowSnapshot::default()),
            ..create.clone()
        };
        assert!(create_with_before.shape_violation().is_some());

        let update_missing_before = Payload {
            op: Some("u".to_string()),
            after: Some(AfterSnapshot::default()),
            ..Payload::default()
        };
        assert!(update_missing_before.shape_violation().is_some());

        let delete = Payload {
            op: Some("d".to_string()),
            before: Some(RowSnapshot::default()),
            ..Payload::default()
        };
        assert!(delete.shape_violation().is_none());

        let unknown = Payload::default();
        assert!(unknown.shape_violation().is_none());
    }

    #[test]
    fn test_source_snapshot_flag() {
        let mut source = SourceInfo {
            snapshot: Some("true".to_string()),
            ..SourceInfo::default()
        };
        assert!(source.is_snapshot());

        source.snapshot = Some("false".to_string());
        assert!(!source.is_snapshot());

        source.snapshot = None;
        assert!(!source.is_snapshot());
    }
}
