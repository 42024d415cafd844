//! Scenario: Identity Never Splits
//!
//! # Invariants under test
//!
//! 1. Re-submitting any previously linked external id resolves to the same key.
//! 2. A record straddling two identities merges them; both old keys keep
//!    resolving to the survivor.
//! 3. The survivor has the most prior contributing sources.
//! 4. Fuzzy matching is a flagged fallback, never used when an exact id matches.
//! 5. Ids shorter than the fuzzy minimum never fuzzy-match.
//!
//! All tests are pure in-process.

use hbt_reconcile::{IdentityIndex, MatchKind};
use hbt_schemas::{BatchRecord, BatchStatus, IdentityConfidence, SourceRole};

fn rec(role: SourceRole, ids: &[&str]) -> BatchRecord {
    ids.iter()
        .fold(BatchRecord::new(role, BatchStatus::Pending), |r, id| {
            r.with_id(*id)
        })
}

#[test]
fn linked_ids_always_resolve_to_the_same_key() {
    let mut idx = IdentityIndex::default();
    let a = idx
        .resolve(&rec(SourceRole::Originator, &["QR-1", "COL-1"]))
        .unwrap();
    for _ in 0..3 {
        for id in ["QR-1", "COL-1"] {
            let again = idx.resolve(&rec(SourceRole::Processor, &[id])).unwrap();
            assert_eq!(again.identity, a.identity);
            assert_eq!(again.match_kind, MatchKind::Exact);
        }
    }
    assert_eq!(idx.len(), 1);
}

#[test]
fn straddling_record_merges_into_survivor_with_more_sources() {
    let mut idx = IdentityIndex::default();
    let big = idx.resolve(&rec(SourceRole::Originator, &["QR-9"])).unwrap();
    idx.resolve(&rec(SourceRole::Processor, &["QR-9"])).unwrap();
    let small = idx.resolve(&rec(SourceRole::Laboratory, &["LAB-55"])).unwrap();
    assert_ne!(big.identity, small.identity);

    let bridge = idx
        .resolve(&rec(SourceRole::Regulator, &["QR-9", "LAB-55"]))
        .unwrap();
    assert!(bridge.is_ambiguous());
    assert_eq!(bridge.identity, big.identity);
    assert_eq!(bridge.absorbed, vec![small.identity.clone()]);

    assert_eq!(idx.len(), 1);
    assert_eq!(idx.lookup("LAB-55"), Some(big.identity.clone()));
    assert_eq!(idx.canonical(&small.identity), Some(big.identity.clone()));
    assert_eq!(idx.entry(&big.identity).unwrap().sources.len(), 4);
}

#[test]
fn fuzzy_fallback_is_flagged_and_exact_wins() {
    let mut idx = IdentityIndex::default();
    let a = idx
        .resolve(&rec(SourceRole::Originator, &["HERB-2024-0042"]))
        .unwrap();

    let fuzzy = idx.resolve(&rec(SourceRole::Processor, &["0042"])).unwrap();
    assert_eq!(fuzzy.match_kind, MatchKind::Fuzzy);
    assert_eq!(fuzzy.identity, a.identity);
    assert_eq!(
        idx.entry(&a.identity).unwrap().confidence,
        IdentityConfidence::Fuzzy
    );

    let exact = idx.resolve(&rec(SourceRole::Laboratory, &["0042"])).unwrap();
    assert_eq!(exact.match_kind, MatchKind::Exact);
}

#[test]
fn short_ids_never_fuzzy_match() {
    let mut idx = IdentityIndex::default();
    idx.resolve(&rec(SourceRole::Originator, &["Q12"])).unwrap();
    let other = idx.resolve(&rec(SourceRole::Processor, &["Q1"])).unwrap();
    assert_eq!(other.match_kind, MatchKind::Created);
    assert_eq!(idx.len(), 2);
}
