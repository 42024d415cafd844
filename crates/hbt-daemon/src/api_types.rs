//! Request and response types for the hbt-daemon HTTP endpoints.
//!
//! Batches, timelines and change events are served as the `hbt-schemas`
//! types themselves; only envelopes live here.

use serde::{Deserialize, Serialize};

use hbt_engine::IngestOutcome;
use hbt_schemas::{IdentityKey, LifecycleStep};

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Hash of the loaded configuration, when the daemon booted from one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

// ---------------------------------------------------------------------------
// /v1/batches/:external_id/timeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineResponse {
    pub identity: IdentityKey,
    pub version: u64,
    pub steps: Vec<LifecycleStep>,
}

// ---------------------------------------------------------------------------
// POST /v1/records
// ---------------------------------------------------------------------------

/// Optional query on `POST /v1/records`: the role the records speak for when
/// they do not carry `sourceRole` themselves.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordsQuery {
    pub role: Option<String>,
}

/// Outcome for one posted record, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    /// "merged" | "unchanged" | "dropped"
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResult {
    pub fn dropped(error: impl Into<String>) -> Self {
        Self {
            outcome: "dropped".to_string(),
            identity: None,
            version: None,
            error: Some(error.into()),
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.outcome == "dropped"
    }
}

impl From<IngestOutcome> for IngestResult {
    fn from(o: IngestOutcome) -> Self {
        match o {
            IngestOutcome::Merged { identity, version } => Self {
                outcome: "merged".to_string(),
                identity: Some(identity),
                version: Some(version),
                error: None,
            },
            IngestOutcome::Unchanged { identity, version } => Self {
                outcome: "unchanged".to_string(),
                identity: Some(identity),
                version: Some(version),
                error: None,
            },
            IngestOutcome::Dropped { reason } => Self::dropped(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub results: Vec<IngestResult>,
}
