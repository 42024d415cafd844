//! Timeline Synthesizer
//!
//! Derives the fixed, ordered lifecycle steps of one canonical batch:
//! Collection, Processing, Lab Testing, Regulatory Review, and Final when the
//! batch is terminal.
//!
//! Per stage, in order:
//! - batch status is one of the stage's "done" values: done, stamped from the
//!   stage's timestamp fields (else the batch `lastUpdated`, estimated);
//! - a completion field is present: Completed, provenance = that field's source;
//! - batch status is past the stage: Completed, inferred (estimated, no
//!   provenance);
//! - batch status equals the stage's active value: InProgress, stamped `now`
//!   (estimated) when no timestamp field exists;
//! - otherwise Pending with no timestamp.
//!
//! A final backward pass removes gaps: an earlier stage that is not done while
//! a later one is gets Completed, estimated, with no provenance, borrowing the
//! next later step's timestamp when it has none of its own.
//!
//! Collection is always Completed. Its timestamp is the batch `createdAt`,
//! which is `None` when no record carried a creation field or `lastUpdated`;
//! the step then has no timestamp and is not marked estimated, since nothing
//! was estimated.
//!
//! `now` is a parameter so the synthesizer stays a pure function.

use chrono::{DateTime, Utc};

use hbt_schemas::{BatchStatus, CanonicalBatch, LifecycleStep, SourceRole, StepKind, StepState};

use crate::record_adapter::parse_timestamp;

/// Attributes that carry the batch creation time, most specific first.
pub const CREATED_AT_FIELDS: &[&str] =
    &["createdAt", "collectionDate", "collectedAt", "harvestDate"];

struct StageRule {
    kind: StepKind,
    active: Option<BatchStatus>,
    done: &'static [BatchStatus],
    completion_fields: &'static [&'static str],
    timestamp_fields: &'static [&'static str],
    past: fn(BatchStatus) -> bool,
}

const STAGES: [StageRule; 3] = [
    StageRule {
        kind: StepKind::Processing,
        active: Some(BatchStatus::Processing),
        done: &[BatchStatus::Processed],
        completion_fields: &[
            "processingCompleted",
            "processingCompletedAt",
            "processedAt",
            "processingEndDate",
        ],
        timestamp_fields: &[
            "processingCompletedAt",
            "processedAt",
            "processingEndDate",
            "processingStarted",
            "processingStartedAt",
            "processingDate",
        ],
        past: |s| s.rank() > BatchStatus::Processed.rank(),
    },
    StageRule {
        kind: StepKind::LabTesting,
        active: Some(BatchStatus::Testing),
        done: &[BatchStatus::Tested],
        completion_fields: &[
            "testResults",
            "labResults",
            "testCompletedAt",
            "testedAt",
            "certificateId",
        ],
        timestamp_fields: &[
            "testCompletedAt",
            "testedAt",
            "labTimestamp",
            "testDate",
            "testStartedAt",
        ],
        past: |s| s.rank() > BatchStatus::Tested.rank(),
    },
    StageRule {
        kind: StepKind::RegulatoryReview,
        active: None,
        done: &[BatchStatus::Approved, BatchStatus::Rejected],
        completion_fields: &[
            "approvedAt",
            "rejectedAt",
            "approvalDate",
            "rejectionDate",
            "regulatoryDecision",
            "rejectionReason",
        ],
        timestamp_fields: &[
            "approvedAt",
            "rejectedAt",
            "approvalDate",
            "rejectionDate",
            "reviewedAt",
            "regulatoryTimestamp",
        ],
        past: |s| s == BatchStatus::Completed,
    },
];

fn done_state(status: BatchStatus) -> StepState {
    match status {
        BatchStatus::Approved => StepState::Approved,
        BatchStatus::Rejected => StepState::Rejected,
        _ => StepState::Completed,
    }
}

/// First field in `names` whose merged value parses as a timestamp.
fn first_timestamp(batch: &CanonicalBatch, names: &[&str]) -> Option<DateTime<Utc>> {
    names
        .iter()
        .find_map(|n| batch.field(n).and_then(parse_timestamp))
}

/// First completion field present. `false` counts as absent.
fn completion_signal<'a>(
    batch: &'a CanonicalBatch,
    names: &[&str],
) -> Option<(&'a str, SourceRole)> {
    names.iter().find_map(|n| {
        let (name, f) = batch.merged_fields.get_key_value(*n)?;
        if f.value.as_bool() == Some(false) {
            return None;
        }
        Some((name.as_str(), f.source))
    })
}

fn step(kind: StepKind, state: StepState) -> LifecycleStep {
    LifecycleStep {
        ordinal: kind.ordinal(),
        kind,
        name: kind.name().to_string(),
        state,
        timestamp: None,
        is_estimated: false,
        provenance: None,
    }
}

/// Completed even without a known creation time; the timestamp stays empty.
fn collection_step(batch: &CanonicalBatch) -> LifecycleStep {
    let mut s = step(StepKind::Collection, StepState::Completed);
    s.timestamp = batch.created_at;
    s.provenance = CREATED_AT_FIELDS
        .iter()
        .find_map(|n| batch.merged_fields.get(*n).map(|f| f.source))
        .or_else(|| {
            batch
                .contributing_sources
                .contains(&SourceRole::Originator)
                .then_some(SourceRole::Originator)
        });
    s
}

/// Returns the step plus the stage's own field timestamp (used by the gap pass).
fn stage_step(
    rule: &StageRule,
    batch: &CanonicalBatch,
    now: DateTime<Utc>,
) -> (LifecycleStep, Option<DateTime<Utc>>) {
    let own_ts = first_timestamp(batch, rule.timestamp_fields);
    let signal = completion_signal(batch, rule.completion_fields);
    let mut s = step(rule.kind, StepState::Pending);

    if rule.done.contains(&batch.status) {
        s.state = done_state(batch.status);
        s.provenance = signal.map(|(_, role)| role).or(batch.status_source);
        s.timestamp = own_ts
            .or_else(|| signal.and_then(|(name, _)| batch.field(name).and_then(parse_timestamp)));
        if s.timestamp.is_none() {
            s.timestamp = batch.last_updated;
            s.is_estimated = true;
        }
    } else if let Some((name, role)) = signal {
        s.state = StepState::Completed;
        s.provenance = Some(role);
        s.timestamp = own_ts.or_else(|| batch.field(name).and_then(parse_timestamp));
    } else if (rule.past)(batch.status) {
        s.state = StepState::Completed;
        s.timestamp = own_ts;
        s.is_estimated = true;
    } else if rule.active == Some(batch.status) {
        s.state = StepState::InProgress;
        s.provenance = batch.status_source;
        match own_ts {
            Some(ts) => s.timestamp = Some(ts),
            None => {
                s.timestamp = Some(now);
                s.is_estimated = true;
            }
        }
    }
    (s, own_ts)
}

fn final_step(batch: &CanonicalBatch, steps: &[LifecycleStep]) -> LifecycleStep {
    let mut s = step(StepKind::Final, done_state(batch.status));
    s.provenance = batch.status_source;
    s.timestamp = batch.last_updated;
    if s.timestamp.is_none() {
        s.timestamp = steps.iter().filter_map(|x| x.timestamp).max();
        s.is_estimated = s.timestamp.is_some();
    }
    s
}

/// Build the timeline for `batch`. `now` stamps in-progress stages that have
/// no timestamp of their own.
pub fn synthesize(batch: &CanonicalBatch, now: DateTime<Utc>) -> Vec<LifecycleStep> {
    let mut steps = vec![collection_step(batch)];
    let mut own = vec![batch.created_at];
    for rule in &STAGES {
        let (s, ts) = stage_step(rule, batch, now);
        steps.push(s);
        own.push(ts);
    }
    if batch.status.is_terminal() {
        let f = final_step(batch, &steps);
        own.push(f.timestamp);
        steps.push(f);
    }

    // Gap pass, latest step first.
    let mut later_done = false;
    let mut later_ts: Option<DateTime<Utc>> = None;
    for i in (0..steps.len()).rev() {
        let s = &mut steps[i];
        if !s.state.is_done() && later_done {
            s.state = StepState::Completed;
            s.is_estimated = true;
            s.provenance = None;
            s.timestamp = own[i].or(later_ts);
        }
        later_done |= s.state.is_done();
        if s.timestamp.is_some() {
            later_ts = s.timestamp;
        }
    }
    steps
}
