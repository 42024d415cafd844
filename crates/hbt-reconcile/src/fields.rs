//! Field Merge Engine
//!
//! Merges attribute values across every record linked to one identity, one
//! attribute at a time.  Whole records never overwrite each other.
//!
//! Winner per attribute, first decisive rule wins:
//! 1. most recent timestamp (per-attribute stamp, else the record's
//!    `lastUpdated`; any timestamp beats none);
//! 2. trust rank of the writing role for the attribute's category;
//! 3. role order, then the canonical JSON text of the value.
//!
//! Rule 3 stands in for "first seen": it is a fixed total order, so the
//! result does not depend on the order records arrived in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use hbt_schemas::{BatchRecord, MergedField, SourceRole};

use crate::arbiter::Arbitration;

// ---------------------------------------------------------------------------
// Attribute categories
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldCategory {
    Collection,
    Processing,
    Testing,
    Decision,
    General,
}

/// A name starting with one of these belongs to that stage, whatever else
/// it mentions: `labReviewNotes` is a lab field, not a decision.
const STAGE_PREFIXES: &[(&str, FieldCategory)] = &[
    ("lab", FieldCategory::Testing),
    ("test", FieldCategory::Testing),
    ("processing", FieldCategory::Processing),
    ("processor", FieldCategory::Processing),
    ("collection", FieldCategory::Collection),
    ("harvest", FieldCategory::Collection),
];

const DECISION_MARKERS: &[&str] = &[
    "approv", "reject", "decision", "regulat", "review", "compliance", "verdict",
];
const TESTING_MARKERS: &[&str] = &[
    "lab", "test", "assay", "purity", "moisture", "pesticide", "heavymetal", "microbial",
    "certificate",
];
const PROCESSING_MARKERS: &[&str] = &[
    "process", "drying", "dried", "grind", "storage", "packag", "extract", "yield",
];
const COLLECTION_MARKERS: &[&str] = &[
    "collect", "harvest", "farmer", "location", "latitude", "longitude", "species", "herb",
    "quantity", "weight", "created",
];

impl FieldCategory {
    /// Classify an attribute by name. A stage prefix decides first; then
    /// markers anywhere in the name, checked in order decision, testing,
    /// processing, collection.
    pub fn of(name: &str) -> Self {
        let n = name.to_ascii_lowercase();
        if let Some((_, category)) = STAGE_PREFIXES.iter().find(|(p, _)| n.starts_with(p)) {
            return *category;
        }
        let hit = |markers: &[&str]| markers.iter().any(|m| n.contains(m));
        if hit(DECISION_MARKERS) {
            FieldCategory::Decision
        } else if hit(TESTING_MARKERS) {
            FieldCategory::Testing
        } else if hit(PROCESSING_MARKERS) {
            FieldCategory::Processing
        } else if hit(COLLECTION_MARKERS) {
            FieldCategory::Collection
        } else {
            FieldCategory::General
        }
    }

    /// Role that owns this category, if any.
    pub fn owner(&self) -> Option<SourceRole> {
        match self {
            FieldCategory::Collection => Some(SourceRole::Originator),
            FieldCategory::Processing => Some(SourceRole::Processor),
            FieldCategory::Testing => Some(SourceRole::Laboratory),
            FieldCategory::Decision => Some(SourceRole::Regulator),
            FieldCategory::General => None,
        }
    }

    /// Owner ranks highest; everyone else by lifecycle order, later stages
    /// trusted more.
    pub fn trust_rank(&self, role: SourceRole) -> u8 {
        if self.owner() == Some(role) {
            return 10;
        }
        match role {
            SourceRole::Originator => 0,
            SourceRole::Processor => 1,
            SourceRole::Laboratory => 2,
            SourceRole::Regulator => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

type CandidateKey = (Option<DateTime<Utc>>, u8, SourceRole, String);

/// Merge all attributes of `records` into one map with per-attribute
/// provenance.
///
/// Decision-category attributes from records that are stale under
/// `arbitration` (anything other than the winning terminal status) are left
/// out, so an overruled approval cannot leak its approver into a rejected
/// batch.
pub fn merge_fields(
    records: &[BatchRecord],
    arbitration: &Arbitration,
) -> BTreeMap<String, MergedField> {
    let mut best: BTreeMap<String, (CandidateKey, MergedField)> = BTreeMap::new();

    for record in records {
        let stale = arbitration.is_stale(record);
        for (name, fv) in &record.fields {
            if fv.value.is_null() {
                continue;
            }
            let category = FieldCategory::of(name);
            if stale && category == FieldCategory::Decision {
                continue;
            }
            let ts = record.field_timestamp(name);
            let key: CandidateKey = (
                ts,
                category.trust_rank(record.source_role),
                record.source_role,
                fv.value.to_string(),
            );
            let replace = match best.get(name) {
                Some((current, _)) => key > *current,
                None => true,
            };
            if replace {
                let merged = MergedField {
                    value: fv.value.clone(),
                    source: record.source_role,
                    updated_at: ts,
                };
                best.insert(name.clone(), (key, merged));
            }
        }
    }

    best.into_iter().map(|(k, (_, m))| (k, m)).collect()
}
