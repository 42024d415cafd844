//! Scenario: Concurrent Ingest
//!
//! # Invariants under test
//!
//! 1. Many producers ingesting into a handful of identities at once yield,
//!    per identity, change events with versions 1, 2, 3, ... in order.
//! 2. The final merged state equals the offline reconciliation of the same
//!    record set.
//! 3. A subscriber filtered on an identity keeps receiving events after that
//!    identity is absorbed into another.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use hbt_engine::{Engine, EngineOptions, IngestOutcome, SubscriptionFilter};
use hbt_reconcile::{reconcile_offline, DEFAULT_FUZZY_MIN_LEN};
use hbt_schemas::{BatchRecord, BatchStatus, SourceRole};

const ROLES: [(SourceRole, BatchStatus); 4] = [
    (SourceRole::Originator, BatchStatus::Pending),
    (SourceRole::Processor, BatchStatus::Processed),
    (SourceRole::Laboratory, BatchStatus::Tested),
    (SourceRole::Regulator, BatchStatus::Approved),
];

fn batch_id(i: usize) -> String {
    format!("BATCH-{i:04}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versions_are_gapless_and_state_matches_offline() {
    let engine = Arc::new(Engine::new(EngineOptions {
        subscriber_buffer: 4096,
        ..EngineOptions::default()
    }));
    let mut sub = engine.subscribe(SubscriptionFilter::All).await;

    let mut all_records = Vec::new();
    let mut tasks = Vec::new();
    for (task, (role, status)) in ROLES.iter().copied().enumerate() {
        let mut mine = Vec::new();
        for n in 0..20 {
            let rec = BatchRecord::new(role, status)
                .with_id(batch_id(n % 4))
                .with_field(format!("note_{}", role.as_str()), json!(format!("t{task}-{n}")));
            mine.push(rec);
        }
        all_records.extend(mine.clone());
        let engine = Arc::clone(&engine);
        tasks.push(tokio::spawn(async move {
            for rec in mine {
                if let IngestOutcome::Dropped { reason } = engine.ingest(rec).await {
                    panic!("unexpected drop: {reason}");
                }
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    let mut last: BTreeMap<String, u64> = BTreeMap::new();
    while let Some(ev) = sub.try_recv() {
        let prev = last.insert(ev.identity.0.clone(), ev.version).unwrap_or(0);
        assert_eq!(ev.version, prev + 1, "identity {} skipped a version", ev.identity);
    }
    assert_eq!(last.len(), 4);

    let offline = reconcile_offline(all_records, DEFAULT_FUZZY_MIN_LEN, Utc::now());
    assert_eq!(offline.batches.len(), 4);
    for expected in &offline.batches {
        let id = expected.batch.external_ids.iter().next().unwrap();
        let view = engine.get_batch_view(id).await.unwrap();
        assert_eq!(view.batch.identity, expected.batch.identity);
        assert_eq!(view.batch.status, BatchStatus::Approved);
        assert_eq!(view.batch.merged_fields, expected.batch.merged_fields);
        assert_eq!(
            view.batch.contributing_sources,
            expected.batch.contributing_sources
        );
        assert_eq!(Some(&view.version), last.get(view.batch.identity.as_str()));
    }
}

#[tokio::test]
async fn identity_subscription_survives_absorption() {
    let engine = Engine::default();
    engine
        .ingest(BatchRecord::new(SourceRole::Originator, BatchStatus::Pending).with_id("QR-1001"))
        .await;
    engine
        .ingest(
            BatchRecord::new(SourceRole::Processor, BatchStatus::Processing).with_id("COL-2002"),
        )
        .await;

    let mut sub = engine.subscribe_to("COL-2002").await.unwrap();

    engine
        .ingest(
            BatchRecord::new(SourceRole::Laboratory, BatchStatus::Tested)
                .with_id("QR-1001")
                .with_id("COL-2002"),
        )
        .await;
    let ev = sub.next_fresh().await.unwrap();
    assert_eq!(ev.batch.status, BatchStatus::Tested);
    assert!(ev.batch.external_ids.contains("COL-2002"));

    engine
        .ingest(BatchRecord::new(SourceRole::Regulator, BatchStatus::Approved).with_id("COL-2002"))
        .await;
    let ev = sub.next_fresh().await.unwrap();
    assert_eq!(ev.batch.status, BatchStatus::Approved);
}
