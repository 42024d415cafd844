//! hbt-reconcile
//!
//! Batch state reconciliation core.
//!
//! Architectural decisions:
//! - Identities are resolved exact-first, fuzzy only as a flagged fallback
//! - Identities never split; ambiguous links merge into a deterministic survivor
//! - Fields merge per attribute by freshness, then category trust, then a fixed order
//! - Status is the maximum-rank report; terminal statuses are sticky
//! - Timelines have fixed ordinals and never show a done step after a pending one
//!
//! Deterministic, pure logic. No IO. The caller supplies `now`.

mod arbiter;
mod engine;
mod fields;
mod identity;
mod record_adapter;
mod timeline;
mod watermark;

pub use arbiter::{arbitrate, Arbitration};
pub use engine::{
    diff_observable, reconcile_batch, reconcile_offline, ObservableChange, OfflineReport,
    Reconciled,
};
pub use fields::{merge_fields, FieldCategory};
pub use identity::{
    IdentityEntry, IdentityIndex, MatchKind, Resolution, ResolveError, DEFAULT_FUZZY_MIN_LEN,
};
pub use record_adapter::{
    decode_raw_record, decode_raw_records, normalize_json, normalize_lenient, normalize_record,
    normalize_status, parse_timestamp, RawBatchRecord, RecordAdapterError,
};
pub use timeline::{synthesize, CREATED_AT_FIELDS};
pub use watermark::{VersionFreshness, VersionWatermark};
