use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use hbt_schemas::{BatchRecord, CanonicalBatch, IdentityKey, LifecycleStep};

use crate::arbiter::arbitrate;
use crate::fields::merge_fields;
use crate::identity::{IdentityEntry, IdentityIndex, ResolveError};
use crate::record_adapter::parse_timestamp;
use crate::timeline::{synthesize, CREATED_AT_FIELDS};

/// A canonical batch together with its synthesized timeline.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled {
    pub batch: CanonicalBatch,
    pub timeline: Vec<LifecycleStep>,
}

/// One observable difference between two reconciliations of an identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObservableChange {
    Status,
    Field { name: String },
    Step { ordinal: u8 },
    TerminalConflict,
    Sources,
}

fn created_at(records: &[BatchRecord]) -> Option<DateTime<Utc>> {
    records
        .iter()
        .flat_map(|r| {
            CREATED_AT_FIELDS
                .iter()
                .filter_map(|n| r.fields.get(*n).and_then(|f| parse_timestamp(&f.value)))
                .chain(r.last_updated)
        })
        .min()
}

fn last_updated(records: &[BatchRecord]) -> Option<DateTime<Utc>> {
    records
        .iter()
        .flat_map(|r| r.fields.values().filter_map(|f| f.updated_at).chain(r.last_updated))
        .max()
}

/// Run the pure pipeline for one identity: arbitrate status, merge fields,
/// derive timestamps, then synthesize the timeline.
///
/// Returns `None` when `records` is empty: an identity with no contributing
/// source is not a batch.
pub fn reconcile_batch(
    identity: &IdentityKey,
    entry: &IdentityEntry,
    records: &[BatchRecord],
    now: DateTime<Utc>,
) -> Option<Reconciled> {
    if records.is_empty() {
        return None;
    }
    let arbitration = arbitrate(records);
    let merged_fields = merge_fields(records, &arbitration);

    let mut external_ids = entry.aliases.clone();
    for r in records {
        external_ids.extend(
            r.external_ids
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        );
    }

    let batch = CanonicalBatch {
        identity: identity.clone(),
        status: arbitration.status,
        status_source: arbitration.status_source,
        merged_fields,
        created_at: created_at(records),
        last_updated: last_updated(records),
        contributing_sources: records.iter().map(|r| r.source_role).collect(),
        external_ids,
        absorbed_identities: entry.absorbed.clone(),
        identity_confidence: entry.confidence,
        terminal_conflict: arbitration.terminal_conflict,
    };
    let timeline = synthesize(&batch, now);
    Some(Reconciled { batch, timeline })
}

/// Observable differences from `prev` to `next`.
///
/// Timestamps are deliberately not compared: an in-progress step is stamped
/// with the reconciliation time, which moves on every run.
pub fn diff_observable(prev: Option<&Reconciled>, next: &Reconciled) -> Vec<ObservableChange> {
    let Some(prev) = prev else {
        return vec![ObservableChange::Status];
    };
    let mut changes = Vec::new();
    let (a, b) = (&prev.batch, &next.batch);

    if a.status != b.status {
        changes.push(ObservableChange::Status);
    }

    let names: BTreeSet<&String> = a.merged_fields.keys().chain(b.merged_fields.keys()).collect();
    for name in names {
        let va = a.merged_fields.get(name).map(|f| &f.value);
        let vb = b.merged_fields.get(name).map(|f| &f.value);
        if va != vb {
            changes.push(ObservableChange::Field { name: name.clone() });
        }
    }

    let steps: BTreeMap<u8, _> = prev.timeline.iter().map(|s| (s.ordinal, s.state)).collect();
    for s in &next.timeline {
        if steps.get(&s.ordinal) != Some(&s.state) {
            changes.push(ObservableChange::Step { ordinal: s.ordinal });
        }
    }
    if prev.timeline.len() > next.timeline.len() {
        for s in &prev.timeline[next.timeline.len()..] {
            changes.push(ObservableChange::Step { ordinal: s.ordinal });
        }
    }

    if a.terminal_conflict != b.terminal_conflict {
        changes.push(ObservableChange::TerminalConflict);
    }
    if a.contributing_sources != b.contributing_sources {
        changes.push(ObservableChange::Sources);
    }
    changes
}

// ---------------------------------------------------------------------------
// Offline (batch) reconciliation
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct OfflineReport {
    /// One entry per live identity, ordered by identity key.
    pub batches: Vec<Reconciled>,
    /// Records dropped for carrying no external id.
    pub dropped: usize,
    /// Survivor → keys absorbed into it.
    pub ambiguous: Vec<(IdentityKey, Vec<IdentityKey>)>,
}

/// Resolve and reconcile a whole record set at once, without a running engine.
pub fn reconcile_offline(
    records: Vec<BatchRecord>,
    fuzzy_min_len: usize,
    now: DateTime<Utc>,
) -> OfflineReport {
    let mut index = IdentityIndex::new(fuzzy_min_len);
    let mut report = OfflineReport::default();
    let mut linked: Vec<(IdentityKey, BatchRecord)> = Vec::new();

    for record in records {
        match index.resolve(&record) {
            Ok(res) => {
                if res.is_ambiguous() {
                    report.ambiguous.push((res.identity.clone(), res.absorbed.clone()));
                }
                linked.push((res.identity, record));
            }
            Err(ResolveError::NoExternalId) => report.dropped += 1,
        }
    }

    let mut groups: BTreeMap<IdentityKey, Vec<BatchRecord>> = BTreeMap::new();
    for (key, record) in linked {
        let live = index.canonical(&key).unwrap_or(key);
        groups.entry(live).or_default().push(record);
    }

    for (key, records) in groups {
        let Some(entry) = index.entry(&key) else {
            continue;
        };
        if let Some(r) = reconcile_batch(&key, entry, &records, now) {
            report.batches.push(r);
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hbt_schemas::{BatchStatus, SourceRole, StepState};
    use serde_json::json;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap()
    }

    fn one(records: Vec<BatchRecord>) -> Reconciled {
        let mut report = reconcile_offline(records, 4, t(12));
        assert_eq!(report.batches.len(), 1);
        report.batches.remove(0)
    }

    #[test]
    fn empty_record_set_is_not_a_batch() {
        let entry = IdentityEntry::default();
        assert!(reconcile_batch(&IdentityKey::new("BATCH-x"), &entry, &[], t(0)).is_none());
    }

    #[test]
    fn created_and_last_updated_span_all_records() {
        let r = one(vec![
            BatchRecord::new(SourceRole::Originator, BatchStatus::Pending)
                .with_id("Q1")
                .with_field("createdAt", json!(t(2).to_rfc3339()))
                .updated_at(t(3)),
            BatchRecord::new(SourceRole::Processor, BatchStatus::Processing)
                .with_id("Q1")
                .with_field_at("dryingMethod", json!("shade"), t(8))
                .updated_at(t(5)),
        ]);
        assert_eq!(r.batch.created_at, Some(t(2)));
        assert_eq!(r.batch.last_updated, Some(t(8)));
        assert_eq!(r.batch.contributing_sources.len(), 2);
    }

    #[test]
    fn identical_inputs_have_no_observable_change() {
        let recs =
            vec![BatchRecord::new(SourceRole::Processor, BatchStatus::Processing).with_id("Q1")];
        let a = one(recs.clone());
        let mut report = reconcile_offline(recs, 4, t(13));
        let b = report.batches.remove(0);
        // The in-progress step is stamped with a different `now`.
        assert_ne!(a.timeline, b.timeline);
        assert!(diff_observable(Some(&a), &b).is_empty());
    }

    #[test]
    fn diff_reports_status_field_and_step_changes() {
        let before = one(vec![
            BatchRecord::new(SourceRole::Processor, BatchStatus::Processing).with_id("Q1")
        ]);
        let after = one(vec![
            BatchRecord::new(SourceRole::Processor, BatchStatus::Processing).with_id("Q1"),
            BatchRecord::new(SourceRole::Processor, BatchStatus::Processed)
                .with_id("Q1")
                .with_field("yieldKg", json!(40)),
        ]);
        let changes = diff_observable(Some(&before), &after);
        assert!(changes.contains(&ObservableChange::Status));
        assert!(changes.contains(&ObservableChange::Field {
            name: "yieldKg".into()
        }));
        assert!(changes.contains(&ObservableChange::Step { ordinal: 1 }));
        assert_eq!(after.timeline[1].state, StepState::Completed);
    }

    #[test]
    fn offline_drops_records_without_ids_and_groups_the_rest() {
        let report = reconcile_offline(
            vec![
                BatchRecord::new(SourceRole::Originator, BatchStatus::Pending).with_id("Q1"),
                BatchRecord::new(SourceRole::Processor, BatchStatus::Processing),
                BatchRecord::new(SourceRole::Originator, BatchStatus::Pending).with_id("Q2"),
            ],
            4,
            t(12),
        );
        assert_eq!(report.dropped, 1);
        assert_eq!(report.batches.len(), 2);
    }

    #[test]
    fn straddling_record_merges_identities_offline() {
        let report = reconcile_offline(
            vec![
                BatchRecord::new(SourceRole::Originator, BatchStatus::Pending).with_id("Q1"),
                BatchRecord::new(SourceRole::Laboratory, BatchStatus::Tested).with_id("LAB-77"),
                BatchRecord::new(SourceRole::Processor, BatchStatus::Processing)
                    .with_id("Q1")
                    .with_id("LAB-77"),
            ],
            4,
            t(12),
        );
        assert_eq!(report.batches.len(), 1);
        assert_eq!(report.ambiguous.len(), 1);
        let b = &report.batches[0].batch;
        assert_eq!(b.status, BatchStatus::Tested);
        assert_eq!(b.absorbed_identities.len(), 1);
        assert!(b.external_ids.contains("LAB-77"));
    }
}
