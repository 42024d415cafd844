//! Scenario: Worked Examples
//!
//! # Invariants under test
//!
//! 1. Three partial views of one batch merge into one record with a gapless
//!    timeline; a stage nobody reported done is inferred from a later one.
//! 2. A regulator rejection is final: a stale cached approval delivered
//!    afterwards keeps the batch Rejected with its reason, and is recorded as
//!    a terminal conflict.
//! 3. A record with no external id is dropped without touching other batches.
//! 4. The JSON fixture loads into the same records the builders produce.

use serde_json::json;

use hbt_engine::IngestOutcome;
use hbt_schemas::{BatchStatus, SourceRole, StepKind, StepState};
use hbt_testkit::{
    load_records_json, scenario_a_records, scenario_b_records, scenario_b_stale_resync,
    scenario_c_record, t, EngineHarness,
};

#[tokio::test]
async fn partial_views_merge_into_a_gapless_timeline() {
    let h = EngineHarness::new().await;
    h.ingest_all(scenario_a_records()).await;

    let view = h.engine.get_batch_view("Q1").await.unwrap();
    assert_eq!(view.batch.status, BatchStatus::Tested);
    assert_eq!(view.batch.contributing_sources.len(), 3);
    assert_eq!(view.batch.created_at, Some(t(1, 8)));
    assert_eq!(view.timeline.len(), 4);

    let collection = &view.timeline[0];
    assert_eq!(collection.state, StepState::Completed);
    assert_eq!(collection.timestamp, Some(t(1, 8)));

    // The processor never said "done"; the lab report implies it.
    let processing = &view.timeline[1];
    assert_eq!(processing.kind, StepKind::Processing);
    assert_eq!(processing.state, StepState::Completed);
    assert_eq!(processing.timestamp, Some(t(2, 8)));
    assert!(processing.is_estimated);

    let lab = &view.timeline[2];
    assert_eq!(lab.state, StepState::Completed);
    assert_eq!(lab.timestamp, Some(t(4, 8)));
    assert_eq!(lab.provenance, Some(SourceRole::Laboratory));

    assert_eq!(view.timeline[3].state, StepState::Pending);
}

#[tokio::test]
async fn stale_approval_after_rejection_is_overruled() {
    let mut h = EngineHarness::new().await;
    h.ingest_all(scenario_b_records()).await;
    let rejected = h.engine.get_batch_view("Q2").await.unwrap();
    assert_eq!(rejected.batch.status, BatchStatus::Rejected);
    assert!(rejected.batch.terminal_conflict.is_none());
    h.drain_events();

    h.engine.ingest(scenario_b_stale_resync()).await;
    let view = h.engine.get_batch_view("Q2").await.unwrap();
    assert_eq!(view.batch.status, BatchStatus::Rejected);
    assert_eq!(view.batch.field("rejectionReason"), Some(&json!("X")));

    let conflict = view.batch.terminal_conflict.as_ref().unwrap();
    assert_eq!(conflict.winner, BatchStatus::Rejected);
    assert!(conflict
        .superseded
        .iter()
        .any(|r| r.status == BatchStatus::Approved));

    assert_eq!(view.timeline.len(), 5);
    assert_eq!(view.timeline[3].state, StepState::Rejected);
    assert_eq!(view.timeline[4].state, StepState::Rejected);

    // Observers see the conflict, never an Approved status.
    let events = h.drain_events();
    assert!(events.iter().all(|e| e.batch.status == BatchStatus::Rejected));
}

#[tokio::test]
async fn record_without_ids_is_dropped_alone() {
    let mut h = EngineHarness::new().await;
    h.ingest_all(scenario_a_records()).await;
    let before = h.engine.get_batch_view("Q1").await.unwrap();
    h.drain_events();

    let outcome = h.engine.ingest(scenario_c_record()).await;
    assert!(matches!(outcome, IngestOutcome::Dropped { .. }), "{outcome:?}");
    assert_eq!(outcome.identity(), None);

    let stats = h.engine.stats().await;
    assert_eq!(stats.records_dropped, 1);
    assert_eq!(stats.identities, 1);
    assert!(h.drain_events().is_empty());

    let after = h.engine.get_batch_view("Q1").await.unwrap();
    assert_eq!(after.batch, before.batch);
    assert_eq!(after.version, before.version);
}

#[test]
fn fixture_file_matches_builders() -> anyhow::Result<()> {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/scenario_a.json");
    let loaded = load_records_json(path, None)?;
    assert_eq!(loaded.len(), 3);

    let built = scenario_a_records();
    for (l, b) in loaded.iter().zip(&built) {
        assert_eq!(l.source_role, b.source_role);
        assert_eq!(l.status, b.status);
        assert!(b.external_ids.is_subset(&l.external_ids));
    }
    Ok(())
}
