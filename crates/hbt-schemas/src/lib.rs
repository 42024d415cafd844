//! hbt-schemas
//!
//! Shared data model for batch reconciliation. Every crate in the workspace
//! speaks these types; none of them carry logic beyond small accessors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Participant roles
// ---------------------------------------------------------------------------

/// The participant that persisted a record. Declaration order is the
/// lifecycle order and is relied on for deterministic tie-breaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SourceRole {
    Originator,
    Processor,
    Laboratory,
    Regulator,
}

impl SourceRole {
    pub const ALL: [SourceRole; 4] = [
        SourceRole::Originator,
        SourceRole::Processor,
        SourceRole::Laboratory,
        SourceRole::Regulator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceRole::Originator => "originator",
            SourceRole::Processor => "processor",
            SourceRole::Laboratory => "laboratory",
            SourceRole::Regulator => "regulator",
        }
    }

    /// Case-insensitive parse. Accepts the portal names used by the
    /// participant apps ("farmer", "lab", ...) as synonyms.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "originator" | "collector" | "farmer" => Some(SourceRole::Originator),
            "processor" | "manufacturer" => Some(SourceRole::Processor),
            "laboratory" | "lab" => Some(SourceRole::Laboratory),
            "regulator" | "regulatory" => Some(SourceRole::Regulator),
            _ => None,
        }
    }
}

impl fmt::Display for SourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Lifecycle status
// ---------------------------------------------------------------------------

/// Lifecycle status as reported by a single participant.
///
/// The derived `Ord` is declaration order and only serves stable sorting.
/// Lifecycle comparisons go through [`BatchStatus::rank`] and
/// [`BatchStatus::terminal_precedence`]: the three terminal values share one rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Processing,
    Processed,
    Testing,
    Tested,
    Approved,
    Rejected,
    Completed,
}

/// Rank shared by every terminal status.
pub const TERMINAL_RANK: u8 = 10;

impl BatchStatus {
    pub fn rank(&self) -> u8 {
        match self {
            BatchStatus::Pending => 0,
            BatchStatus::Processing => 1,
            BatchStatus::Processed => 2,
            BatchStatus::Testing => 3,
            BatchStatus::Tested => 4,
            BatchStatus::Approved | BatchStatus::Rejected | BatchStatus::Completed => {
                TERMINAL_RANK
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == TERMINAL_RANK
    }

    /// Rejected > Approved > Completed. Zero for non-terminal values.
    pub fn terminal_precedence(&self) -> u8 {
        match self {
            BatchStatus::Rejected => 3,
            BatchStatus::Approved => 2,
            BatchStatus::Completed => 1,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Processed => "processed",
            BatchStatus::Testing => "testing",
            BatchStatus::Tested => "tested",
            BatchStatus::Approved => "approved",
            BatchStatus::Rejected => "rejected",
            BatchStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Per-source record
// ---------------------------------------------------------------------------

/// One attribute value as written by a participant, optionally stamped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldValue {
    pub value: Value,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FieldValue {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            updated_at: None,
        }
    }

    pub fn at(value: Value, updated_at: DateTime<Utc>) -> Self {
        Self {
            value,
            updated_at: Some(updated_at),
        }
    }
}

/// One participant's partial, independently written view of a batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub source_role: SourceRole,
    pub external_ids: BTreeSet<String>,
    pub status: BatchStatus,
    pub fields: BTreeMap<String, FieldValue>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl BatchRecord {
    pub fn new(source_role: SourceRole, status: BatchStatus) -> Self {
        Self {
            source_role,
            external_ids: BTreeSet::new(),
            status,
            fields: BTreeMap::new(),
            last_updated: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.external_ids.insert(id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), FieldValue::new(value));
        self
    }

    pub fn with_field_at(
        mut self,
        name: impl Into<String>,
        value: Value,
        updated_at: DateTime<Utc>,
    ) -> Self {
        self.fields
            .insert(name.into(), FieldValue::at(value, updated_at));
        self
    }

    pub fn updated_at(mut self, ts: DateTime<Utc>) -> Self {
        self.last_updated = Some(ts);
        self
    }

    /// Effective timestamp of one attribute: its own stamp, else the record's.
    pub fn field_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.fields
            .get(name)
            .and_then(|f| f.updated_at)
            .or(self.last_updated)
    }
}

// ---------------------------------------------------------------------------
// Canonical (merged) batch
// ---------------------------------------------------------------------------

/// Stable canonical identity key (e.g. `BATCH-3f0c...`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(pub String);

impl IdentityKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the identity was linked. `Fuzzy` means at least one record attached
/// through suffix/substring matching rather than an exact id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityConfidence {
    #[default]
    Exact,
    Fuzzy,
}

/// The winning value for one attribute plus the role that supplied it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedField {
    pub value: Value,
    pub source: SourceRole,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A status as reported by one role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedStatus {
    pub source: SourceRole,
    pub status: BatchStatus,
}

/// Two or more different terminal statuses were reported. Kept on the batch
/// so dashboards can show what was overruled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalConflict {
    pub winner: BatchStatus,
    pub winner_sources: BTreeSet<SourceRole>,
    /// Losing terminal reports, sorted.
    pub superseded: Vec<ReportedStatus>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalBatch {
    pub identity: IdentityKey,
    pub status: BatchStatus,
    /// Role whose report decided `status`.
    pub status_source: Option<SourceRole>,
    pub merged_fields: BTreeMap<String, MergedField>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub contributing_sources: BTreeSet<SourceRole>,
    /// Every external id linked to this identity.
    pub external_ids: BTreeSet<String>,
    /// Identity keys merged into this one after an ambiguous resolution.
    pub absorbed_identities: BTreeSet<IdentityKey>,
    pub identity_confidence: IdentityConfidence,
    pub terminal_conflict: Option<TerminalConflict>,
}

impl CanonicalBatch {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.merged_fields.get(name).map(|f| &f.value)
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepKind {
    Collection,
    Processing,
    LabTesting,
    RegulatoryReview,
    Final,
}

impl StepKind {
    pub fn ordinal(&self) -> u8 {
        match self {
            StepKind::Collection => 0,
            StepKind::Processing => 1,
            StepKind::LabTesting => 2,
            StepKind::RegulatoryReview => 3,
            StepKind::Final => 4,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Collection => "Collection",
            StepKind::Processing => "Processing",
            StepKind::LabTesting => "Lab Testing",
            StepKind::RegulatoryReview => "Regulatory Review",
            StepKind::Final => "Final",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    InProgress,
    Completed,
    Approved,
    Rejected,
}

impl StepState {
    /// Completed, Approved and Rejected all mean the step happened.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Approved | StepState::Rejected
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStep {
    pub ordinal: u8,
    pub kind: StepKind,
    pub name: String,
    pub state: StepState,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_estimated: bool,
    pub provenance: Option<SourceRole>,
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// Published after every merge that changed something observable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub identity: IdentityKey,
    /// Per-identity, starts at 1, increments by one per published change.
    pub version: u64,
    pub batch: CanonicalBatch,
    pub timeline: Vec<LifecycleStep>,
    pub emitted_at: DateTime<Utc>,
}
