use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use hbt_schemas::{
    BatchStatus, CanonicalBatch, IdentityConfidence, LifecycleStep, MergedField, SourceRole,
    StepState, TerminalConflict,
};

/// One timeline step without its in-progress timestamp, which is the
/// reconciliation time and differs between runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepView {
    pub ordinal: u8,
    pub state: StepState,
    pub timestamp: Option<DateTime<Utc>>,
    pub is_estimated: bool,
    pub provenance: Option<SourceRole>,
}

/// Everything two reconciliations of the same record set must agree on.
///
/// The identity key and the absorbed keys are left out: when two identities
/// merge, which key survives depends on which ids arrived first.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvergenceView {
    pub status: BatchStatus,
    pub status_source: Option<SourceRole>,
    pub merged_fields: BTreeMap<String, MergedField>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub contributing_sources: BTreeSet<SourceRole>,
    pub external_ids: BTreeSet<String>,
    pub identity_confidence: IdentityConfidence,
    pub terminal_conflict: Option<TerminalConflict>,
    pub steps: Vec<StepView>,
}

pub fn convergence_view(batch: &CanonicalBatch, timeline: &[LifecycleStep]) -> ConvergenceView {
    ConvergenceView {
        status: batch.status,
        status_source: batch.status_source,
        merged_fields: batch.merged_fields.clone(),
        created_at: batch.created_at,
        last_updated: batch.last_updated,
        contributing_sources: batch.contributing_sources.clone(),
        external_ids: batch.external_ids.clone(),
        identity_confidence: batch.identity_confidence,
        terminal_conflict: batch.terminal_conflict.clone(),
        steps: timeline
            .iter()
            .map(|s| StepView {
                ordinal: s.ordinal,
                state: s.state,
                timestamp: if s.state == StepState::InProgress {
                    None
                } else {
                    s.timestamp
                },
                is_estimated: s.is_estimated,
                provenance: s.provenance,
            })
            .collect(),
    }
}

/// Every ordering of `items` (Heap's algorithm). Meant for small sets.
pub fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    let mut current = items.to_vec();
    let mut out = vec![current.clone()];
    let n = current.len();
    let mut c = vec![0usize; n];
    let mut i = 0;
    while i < n {
        if c[i] < i {
            if i % 2 == 0 {
                current.swap(0, i);
            } else {
                current.swap(c[i], i);
            }
            out.push(current.clone());
            c[i] += 1;
            i = 0;
        } else {
            c[i] = 0;
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permutations_are_complete_and_distinct() {
        let perms = permutations(&[1, 2, 3, 4]);
        assert_eq!(perms.len(), 24);
        let distinct: BTreeSet<Vec<i32>> = perms.into_iter().collect();
        assert_eq!(distinct.len(), 24);
    }
}
