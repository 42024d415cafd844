use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use hbt_audit::AuditKind;
use hbt_schemas::IdentityKey;
use hbt_sources::RecordSource;

use crate::engine::{Engine, IngestOutcome};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Distinct identities that published at least one change.
    pub identities_updated: usize,
    /// Sources that failed or timed out this cycle.
    pub sources_skipped: usize,
    pub records_seen: usize,
    pub records_dropped: usize,
}

impl Engine {
    /// Pull every source once and ingest what they return.
    ///
    /// Sources are fetched concurrently, each bounded by `timeout`. A source
    /// that errors or times out contributes no records this cycle
    /// (SourceUnavailable); the others are still ingested. Items a source
    /// could not decode are dropped one by one like any malformed record.
    pub async fn resync(
        &self,
        sources: &[Arc<dyn RecordSource>],
        timeout: Duration,
    ) -> ResyncReport {
        let fetches = sources.iter().map(|source| async move {
            let result = tokio::time::timeout(timeout, source.fetch_records()).await;
            (source, result)
        });
        let results = join_all(fetches).await;

        let mut report = ResyncReport::default();
        let mut updated: BTreeSet<IdentityKey> = BTreeSet::new();
        for (source, result) in results {
            let fetched = match result {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(e)) => {
                    self.source_unavailable(source.as_ref(), e.to_string()).await;
                    report.sources_skipped += 1;
                    continue;
                }
                Err(_) => {
                    let reason = format!("timed out after {}ms", timeout.as_millis());
                    self.source_unavailable(source.as_ref(), reason).await;
                    report.sources_skipped += 1;
                    continue;
                }
            };

            report.records_seen += fetched.len();
            let role = source.role();
            for bad in fetched.malformed {
                self.drop_malformed(bad.to_string(), Some(role), bad.ids()).await;
                report.records_dropped += 1;
            }
            for raw in fetched.records {
                match self.ingest_raw(raw, Some(role)).await {
                    IngestOutcome::Merged { identity, .. } => {
                        updated.insert(identity);
                    }
                    IngestOutcome::Unchanged { .. } => {}
                    IngestOutcome::Dropped { .. } => report.records_dropped += 1,
                }
            }
        }
        report.identities_updated = updated.len();

        info!(
            sources = sources.len(),
            skipped = report.sources_skipped,
            records = report.records_seen,
            dropped = report.records_dropped,
            updated = report.identities_updated,
            "resync complete"
        );
        report
    }

    async fn source_unavailable(&self, source: &dyn RecordSource, reason: String) {
        warn!(
            source = %source.name(),
            role = %source.role(),
            reason = %reason,
            "source unavailable; skipped"
        );
        self.audit(
            AuditKind::SourceUnavailable,
            None,
            json!({ "source": source.name(), "role": source.role(), "reason": reason }),
        )
        .await;
    }
}
