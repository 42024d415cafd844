//! Record Adapter: deserialize participant wire records and normalize them.
//!
//! # Purpose
//! Each participant portal persists its own JSON document per batch, keyed by
//! whatever identifiers it generated locally (`qrCode`, `collectionId`, `id`)
//! and using its own spelling of the lifecycle status.  This module defines
//! the *raw* (wire-level) record and a single [`normalize_record`] function
//! that converts it into the internal [`BatchRecord`].
//!
//! # Design constraints
//! - Pure, deterministic conversion. No IO, no async.
//! - Every normalization failure is a [`RecordAdapterError`]; all of them mean
//!   the record is malformed and must be dropped by the caller, never merged.
//! - Unknown attributes are kept verbatim; `null` attributes are ignored so a
//!   portal that blanks a field cannot erase another participant's value.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use hbt_schemas::{BatchRecord, BatchStatus, FieldValue, SourceRole};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All errors that can occur during record normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordAdapterError {
    /// None of `qrCode`, `collectionId`, `id` carried a usable value.
    NoExternalId,
    /// The record did not say which participant wrote it and the caller gave no hint.
    MissingRole,
    /// `sourceRole` could not be mapped to [`SourceRole`].
    UnknownRole { raw: String },
    /// `status` could not be mapped to [`BatchStatus`].
    UnknownStatus { external_id: String, raw: String },
    /// A timestamp was neither RFC 3339, a plain date, nor epoch milliseconds.
    InvalidTimestamp {
        external_id: String,
        field: String,
        raw: String,
    },
    /// Item `index` of a payload did not deserialize as a record at all.
    /// `ids` holds whatever `qrCode` / `collectionId` / `id` could be read.
    Undecodable {
        index: usize,
        reason: String,
        ids: Value,
    },
}

impl RecordAdapterError {
    /// Identifiers salvaged from the failed item, for logs and audit.
    pub fn ids(&self) -> Value {
        match self {
            Self::Undecodable { index, ids, .. } => json!({ "index": index, "ids": ids }),
            Self::UnknownStatus { external_id, .. }
            | Self::InvalidTimestamp { external_id, .. } => json!({ "externalId": external_id }),
            _ => Value::Null,
        }
    }
}

impl std::fmt::Display for RecordAdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoExternalId => write!(
                f,
                "malformed record: no qrCode, collectionId or id present"
            ),
            Self::MissingRole => write!(f, "malformed record: source role unknown"),
            Self::UnknownRole { raw } => {
                write!(f, "malformed record: unrecognised source role '{raw}'")
            }
            Self::UnknownStatus { external_id, raw } => write!(
                f,
                "malformed record '{external_id}': unrecognised status '{raw}'"
            ),
            Self::InvalidTimestamp {
                external_id,
                field,
                raw,
            } => write!(
                f,
                "malformed record '{external_id}': field '{field}' has invalid timestamp '{raw}'"
            ),
            Self::Undecodable { index, reason, .. } => {
                write!(f, "malformed record at position {index}: {reason}")
            }
        }
    }
}

impl std::error::Error for RecordAdapterError {}

// ---------------------------------------------------------------------------
// Raw wire-level record  (portal JSON → this → BatchRecord)
// ---------------------------------------------------------------------------

/// Wire-level batch record as persisted by a participant portal.
///
/// Every key not listed here lands in `attributes`.  Unknown keys are never
/// an error (`deny_unknown_fields` is NOT set).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBatchRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    /// Some portals write numeric ids, so this stays untyped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Value>,
    /// Optional per-attribute timestamps: attribute name → timestamp.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_timestamps: BTreeMap<String, Value>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

fn collect_external_ids(raw: &RawBatchRecord) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for s in [raw.qr_code.as_deref(), raw.collection_id.as_deref()]
        .into_iter()
        .flatten()
    {
        let t = s.trim();
        if !t.is_empty() {
            ids.insert(t.to_string());
        }
    }
    match &raw.id {
        Some(Value::String(s)) if !s.trim().is_empty() => {
            ids.insert(s.trim().to_string());
        }
        Some(Value::Number(n)) => {
            ids.insert(n.to_string());
        }
        _ => {}
    }
    ids
}

/// Map a portal status string onto [`BatchStatus`]. Case, spaces and dashes
/// are ignored.
pub fn normalize_status(raw: &str) -> Option<BatchStatus> {
    let key = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    let status = match key.as_str() {
        "pending" | "created" | "collected" | "new" | "submitted" => BatchStatus::Pending,
        "processing" | "in_processing" | "in_progress" | "processing_started" => {
            BatchStatus::Processing
        }
        "processed" | "processing_complete" | "processing_completed" => BatchStatus::Processed,
        "testing" | "lab_testing" | "in_testing" | "under_test" => BatchStatus::Testing,
        "tested" | "test_complete" | "test_completed" | "lab_complete" | "lab_completed" => {
            BatchStatus::Tested
        }
        "approved" | "approved_by_regulator" | "certified" => BatchStatus::Approved,
        "rejected" | "rejected_by_regulator" | "failed" => BatchStatus::Rejected,
        "completed" | "complete" | "done" | "delivered" => BatchStatus::Completed,
        _ => return None,
    };
    Some(status)
}

/// Parse a wire timestamp: RFC 3339 string, `YYYY-MM-DD` date (midnight UTC),
/// or integer epoch milliseconds.
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
            Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
        }
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        _ => None,
    }
}

fn timestamp_field(
    external_id: &str,
    field: &str,
    v: &Value,
) -> Result<Option<DateTime<Utc>>, RecordAdapterError> {
    if v.is_null() {
        return Ok(None);
    }
    parse_timestamp(v)
        .map(Some)
        .ok_or_else(|| RecordAdapterError::InvalidTimestamp {
            external_id: external_id.to_string(),
            field: field.to_string(),
            raw: v.to_string(),
        })
}

fn resolve_role(
    raw: &RawBatchRecord,
    role_hint: Option<SourceRole>,
) -> Result<SourceRole, RecordAdapterError> {
    // The source a record was read from is authoritative over what the
    // record claims about itself.
    if let Some(role) = role_hint {
        return Ok(role);
    }
    match raw.source_role.as_deref() {
        Some(s) => SourceRole::parse(s).ok_or_else(|| RecordAdapterError::UnknownRole {
            raw: s.to_string(),
        }),
        None => Err(RecordAdapterError::MissingRole),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Normalize one raw record into a [`BatchRecord`].
///
/// `role_hint` is the role of the source the record was read from; when
/// absent the record's own `sourceRole` key is used.  A record without a
/// status is treated as `Pending`.
pub fn normalize_record(
    raw: RawBatchRecord,
    role_hint: Option<SourceRole>,
) -> Result<BatchRecord, RecordAdapterError> {
    let external_ids = collect_external_ids(&raw);
    let Some(first_id) = external_ids.iter().next().cloned() else {
        return Err(RecordAdapterError::NoExternalId);
    };
    let source_role = resolve_role(&raw, role_hint)?;

    let status = match raw.status.as_deref() {
        None => BatchStatus::Pending,
        Some(s) => normalize_status(s).ok_or_else(|| RecordAdapterError::UnknownStatus {
            external_id: first_id.clone(),
            raw: s.to_string(),
        })?,
    };

    let last_updated = match &raw.last_updated {
        Some(v) => timestamp_field(&first_id, "lastUpdated", v)?,
        None => None,
    };

    let mut fields = BTreeMap::new();
    for (name, value) in raw.attributes {
        if value.is_null() {
            continue;
        }
        let updated_at = match raw.field_timestamps.get(&name) {
            Some(ts) => timestamp_field(&first_id, &name, ts)?,
            None => None,
        };
        fields.insert(name, FieldValue { value, updated_at });
    }

    Ok(BatchRecord {
        source_role,
        external_ids,
        status,
        fields,
        last_updated,
    })
}

/// Lenient batch variant: malformed records are returned as errors next to
/// the records that normalized cleanly, in input order.
pub fn normalize_lenient(
    raws: Vec<RawBatchRecord>,
    role_hint: Option<SourceRole>,
) -> (Vec<BatchRecord>, Vec<RecordAdapterError>) {
    let mut records = Vec::new();
    let mut errors = Vec::new();
    for raw in raws {
        match normalize_record(raw, role_hint) {
            Ok(r) => records.push(r),
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}

/// Deserialize one wire item. `index` is its position in the payload.
pub fn decode_raw_record(index: usize, item: Value) -> Result<RawBatchRecord, RecordAdapterError> {
    let ids = salvage_ids(&item);
    serde_json::from_value(item).map_err(|e| RecordAdapterError::Undecodable {
        index,
        reason: e.to_string(),
        ids,
    })
}

/// Deserialize wire items one at a time. A wrong-typed item is reported and
/// skipped; it never takes its neighbours down with it.
pub fn decode_raw_records(items: Vec<Value>) -> (Vec<RawBatchRecord>, Vec<RecordAdapterError>) {
    let mut records = Vec::with_capacity(items.len());
    let mut errors = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        match decode_raw_record(index, item) {
            Ok(raw) => records.push(raw),
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}

fn salvage_ids(item: &Value) -> Value {
    let mut ids = serde_json::Map::new();
    if let Value::Object(map) = item {
        for key in ["qrCode", "collectionId", "id"] {
            if let Some(v) = map.get(key) {
                ids.insert(key.to_string(), v.clone());
            }
        }
    }
    Value::Object(ids)
}

/// Deserialize and normalize a JSON document holding one record or an array
/// of records. Only unparseable JSON is an `Err`; bad items come back as
/// errors next to the good records.
pub fn normalize_json(
    json: &str,
    role_hint: Option<SourceRole>,
) -> Result<(Vec<BatchRecord>, Vec<RecordAdapterError>), serde_json::Error> {
    let items = match serde_json::from_str::<Value>(json)? {
        Value::Array(items) => items,
        other => vec![other],
    };
    let (raws, mut errors) = decode_raw_records(items);
    let (records, rejected) = normalize_lenient(raws, role_hint);
    errors.extend(rejected);
    Ok((records, errors))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
