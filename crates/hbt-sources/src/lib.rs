//! hbt-sources
//!
//! Record Store Adapter boundary: one logical source per participant role,
//! each returning that participant's raw wire records.
//!
//! This crate does **not** normalize or merge. Callers (the engine) hand the
//! raw records to `hbt_reconcile::normalize_record` with the source's role as
//! the hint, so a source can never speak for another participant.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use hbt_config::{resolve_source_token, SourceKind, SourceSpec};
use hbt_reconcile::{decode_raw_records, RawBatchRecord, RecordAdapterError};
use hbt_schemas::SourceRole;

mod http;
mod json_file;
mod memory;

pub use http::HttpSource;
pub use json_file::JsonFileSource;
pub use memory::InMemorySource;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a [`RecordSource`] may return. Every variant is transient from the
/// engine's point of view: the source is skipped for this cycle.
#[derive(Debug)]
pub enum SourceError {
    /// The backing store is not reachable right now.
    Unavailable(String),
    /// Network or transport failure.
    Transport(String),
    /// The upstream answered with a non-success status.
    Api { status: u16, message: String },
    /// The payload could not be decoded as records.
    Decode(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Unavailable(msg) => write!(f, "source unavailable: {msg}"),
            SourceError::Transport(msg) => write!(f, "transport error: {msg}"),
            SourceError::Api { status, message } => {
                write!(f, "source api error status={status}: {message}")
            }
            SourceError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

// ---------------------------------------------------------------------------
// Fetch result
// ---------------------------------------------------------------------------

/// One fetch from a source. Items that did not decode as records are
/// reported in `malformed`; the rest of the payload still comes through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRecords {
    pub records: Vec<RawBatchRecord>,
    pub malformed: Vec<RecordAdapterError>,
}

impl FetchedRecords {
    pub fn len(&self) -> usize {
        self.records.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<RawBatchRecord>> for FetchedRecords {
    fn from(records: Vec<RawBatchRecord>) -> Self {
        Self {
            records,
            malformed: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// Per-participant record store.
///
/// Object safe so callers can hold `Arc<dyn RecordSource>`; `Send + Sync`
/// so fetches can run concurrently on the runtime.
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    /// Participant this source speaks for.
    fn role(&self) -> SourceRole;

    /// Human-readable name for logs (e.g. `"json_file:data/lab.json"`).
    fn name(&self) -> String;

    /// Every record currently held by the source, in source order. A
    /// payload that is unreadable as a whole is an error; single bad items
    /// are not.
    async fn fetch_records(&self) -> Result<FetchedRecords, SourceError>;
}

/// Decode a source payload: an array of records, a single record, or an
/// object wrapping the array under `records`. Items are decoded one by one.
pub(crate) fn decode_records(body: serde_json::Value) -> Result<FetchedRecords, SourceError> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("records") {
            Some(serde_json::Value::Array(items)) => items,
            Some(other) => {
                return Err(SourceError::Decode(format!(
                    "`records` must be an array, got {other}"
                )))
            }
            None => vec![serde_json::Value::Object(map)],
        },
        other => {
            return Err(SourceError::Decode(format!(
                "expected record array or object, got {other}"
            )))
        }
    };
    let (records, malformed) = decode_raw_records(items);
    Ok(FetchedRecords { records, malformed })
}

/// Build the configured resync sources, resolving HTTP tokens from the
/// environment once, here.
pub fn build_sources(specs: &[SourceSpec]) -> Result<Vec<Arc<dyn RecordSource>>> {
    let mut out: Vec<Arc<dyn RecordSource>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let source: Arc<dyn RecordSource> = match &spec.kind {
            SourceKind::JsonFile { path } => Arc::new(JsonFileSource::new(spec.role, path)),
            SourceKind::Http { url, .. } => {
                let token = resolve_source_token(spec)?;
                Arc::new(HttpSource::new(spec.role, url.clone(), token))
            }
        };
        out.push(source);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_accepts_array_single_and_wrapped() {
        assert_eq!(decode_records(json!([{"qrCode": "A"}, {"qrCode": "B"}])).unwrap().len(), 2);
        assert_eq!(decode_records(json!({"qrCode": "A"})).unwrap().len(), 1);
        assert_eq!(
            decode_records(json!({"records": [{"qrCode": "A"}]})).unwrap().records[0]
                .qr_code
                .as_deref(),
            Some("A")
        );
    }

    #[test]
    fn decode_keeps_good_items_next_to_a_wrong_typed_one() {
        let fetched = decode_records(json!({"records": [
            {"qrCode": "A", "status": "tested"},
            {"qrCode": 12345},
            {"qrCode": "B"},
        ]}))
        .unwrap();
        assert_eq!(fetched.len(), 3);
        let kept: Vec<_> = fetched.records.iter().filter_map(|r| r.qr_code.as_deref()).collect();
        assert_eq!(kept, vec!["A", "B"]);
        assert!(matches!(
            fetched.malformed.as_slice(),
            [RecordAdapterError::Undecodable { index: 1, .. }]
        ));
    }

    #[test]
    fn decode_rejects_scalars() {
        assert!(matches!(decode_records(json!(42)), Err(SourceError::Decode(_))));
        assert!(matches!(
            decode_records(json!({"records": "nope"})),
            Err(SourceError::Decode(_))
        ));
    }

    #[test]
    fn build_sources_maps_specs_to_roles() {
        let specs = vec![
            SourceSpec {
                role: SourceRole::Originator,
                kind: SourceKind::JsonFile {
                    path: "collections.json".into(),
                },
            },
            SourceSpec {
                role: SourceRole::Laboratory,
                kind: SourceKind::Http {
                    url: "http://lab.local/records".into(),
                    token_env: None,
                },
            },
        ];
        let sources = build_sources(&specs).unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].role(), SourceRole::Originator);
        assert_eq!(sources[1].role(), SourceRole::Laboratory);
        assert!(sources[1].name().starts_with("http:"));
    }

    #[test]
    fn source_error_display() {
        let err = SourceError::Api {
            status: 503,
            message: "maintenance".into(),
        };
        assert_eq!(err.to_string(), "source api error status=503: maintenance");
    }
}
