//! Change-data-capture envelope model.
//!
//! The queue carries Debezium-style JSON envelopes:
//!
//! ```json
//! {
//!   "schema": { ... },
//!   "payload": {
//!     "op": "u",
//!     "ts_ms": 1700000000000,
//!     "before": { "customer_id": 7, "email": "old@example.com" },
//!     "after":  { "customer_id": 7, "email": "new@example.com", "modified_date": 1700000000000 },
//!     "source": { "connector": "sqlserver", "db": "shop", "schema": "dbo", "table": "Customers" }
//!   }
//! }
//! ```
//!
//! Every field is optional and "absent" stays distinguishable from zero/empty.
//! Classification into a [`ChangeEvent`] never fails; decoding raw bytes does.

mod model;
mod operation;

pub use model::{AfterSnapshot, CdcEnvelope, Payload, RowSnapshot, SourceInfo};
pub use operation::{ChangeEvent, Operation};
