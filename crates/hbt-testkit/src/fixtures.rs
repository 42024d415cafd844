use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use hbt_schemas::{BatchRecord, BatchStatus, SourceRole};

/// 2024-03-`day` `hour`:00 UTC.
pub fn t(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0)
        .single()
        .unwrap_or_default()
}

fn rfc3339(ts: DateTime<Utc>) -> serde_json::Value {
    json!(ts.to_rfc3339())
}

/// Originator, Processor and Laboratory views of batch `Q1`. The processor
/// never reports completion; the lab's report implies it.
pub fn scenario_a_records() -> Vec<BatchRecord> {
    vec![
        BatchRecord::new(SourceRole::Originator, BatchStatus::Pending)
            .with_id("Q1")
            .with_field("createdAt", rfc3339(t(1, 8))),
        BatchRecord::new(SourceRole::Processor, BatchStatus::Processing)
            .with_id("Q1")
            .with_field("processingStarted", rfc3339(t(2, 8))),
        BatchRecord::new(SourceRole::Laboratory, BatchStatus::Tested)
            .with_id("Q1")
            .with_field("labTimestamp", rfc3339(t(4, 8))),
    ]
}

/// Batch `Q2` rejected by the regulator with reason "X".
pub fn scenario_b_records() -> Vec<BatchRecord> {
    vec![
        BatchRecord::new(SourceRole::Originator, BatchStatus::Pending)
            .with_id("Q2")
            .with_field("createdAt", rfc3339(t(1, 9))),
        BatchRecord::new(SourceRole::Laboratory, BatchStatus::Tested)
            .with_id("Q2")
            .with_field("labTimestamp", rfc3339(t(3, 9))),
        BatchRecord::new(SourceRole::Regulator, BatchStatus::Rejected)
            .with_id("Q2")
            .with_field("rejectionReason", json!("X"))
            .with_field("rejectedAt", rfc3339(t(5, 9)))
            .updated_at(t(5, 9)),
    ]
}

/// What a stale resync delivers for `Q2`: a cached approval written before
/// the rejection.
pub fn scenario_b_stale_resync() -> BatchRecord {
    BatchRecord::new(SourceRole::Regulator, BatchStatus::Approved)
        .with_id("Q2")
        .with_field("approvedAt", rfc3339(t(4, 9)))
        .updated_at(t(4, 9))
}

/// A record with no external id at all.
pub fn scenario_c_record() -> BatchRecord {
    BatchRecord::new(SourceRole::Processor, BatchStatus::Processed)
        .with_field("processedAt", rfc3339(t(2, 12)))
}

/// A full lifecycle for `id`, with competing writes to shared attributes so
/// merge order would matter without the freshness rule.
pub fn lifecycle_records(id: &str) -> Vec<BatchRecord> {
    vec![
        BatchRecord::new(SourceRole::Originator, BatchStatus::Pending)
            .with_id(id)
            .with_field("createdAt", rfc3339(t(1, 6)))
            .with_field_at("quantityKg", json!(120), t(1, 6)),
        BatchRecord::new(SourceRole::Processor, BatchStatus::Processing)
            .with_id(id)
            .with_field("processingStarted", rfc3339(t(2, 6)))
            .with_field_at("quantityKg", json!(115), t(2, 7)),
        BatchRecord::new(SourceRole::Processor, BatchStatus::Processed)
            .with_id(id)
            .with_field("processedAt", rfc3339(t(2, 18))),
        BatchRecord::new(SourceRole::Laboratory, BatchStatus::Tested)
            .with_id(id)
            .with_field("testResults", json!({"pesticides": "pass"}))
            .with_field("testedAt", rfc3339(t(3, 10))),
        BatchRecord::new(SourceRole::Regulator, BatchStatus::Approved)
            .with_id(id)
            .with_field("approvedAt", rfc3339(t(4, 10)))
            .updated_at(t(4, 10)),
    ]
}

/// Three records that only link up through the last one: a QR-coded
/// originator record, a collection-id processor record, and a lab record
/// carrying both ids.
pub fn bridging_records() -> Vec<BatchRecord> {
    vec![
        BatchRecord::new(SourceRole::Originator, BatchStatus::Pending)
            .with_id("QR-5001")
            .with_field("createdAt", rfc3339(t(1, 7))),
        BatchRecord::new(SourceRole::Processor, BatchStatus::Processed)
            .with_id("COL-9001")
            .with_field("processedAt", rfc3339(t(2, 7))),
        BatchRecord::new(SourceRole::Laboratory, BatchStatus::Testing)
            .with_id("QR-5001")
            .with_id("COL-9001")
            .with_field("testStartedAt", rfc3339(t(3, 7))),
    ]
}
