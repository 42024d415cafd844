use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use hbt_audit::{AuditKind, AuditWriter};
use hbt_config::EngineSettings;
use hbt_reconcile::{
    diff_observable, normalize_record, reconcile_batch, synthesize, IdentityEntry, IdentityIndex,
    RawBatchRecord, Reconciled, DEFAULT_FUZZY_MIN_LEN,
};
use hbt_schemas::{
    BatchRecord, CanonicalBatch, ChangeEvent, IdentityConfidence, IdentityKey, LifecycleStep,
    SourceRole,
};

use crate::error::QueryError;
use crate::notifier::{Notifier, Subscription, SubscriptionFilter};

/// Bound on retired-slot hops a query follows before giving up.
const MAX_REDIRECT_HOPS: usize = 8;

// ---------------------------------------------------------------------------
// Options / results
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    pub fuzzy_min_len: usize,
    pub subscriber_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fuzzy_min_len: DEFAULT_FUZZY_MIN_LEN,
            subscriber_buffer: 256,
        }
    }
}

impl From<&EngineSettings> for EngineOptions {
    fn from(s: &EngineSettings) -> Self {
        Self {
            fuzzy_min_len: s.fuzzy_min_len,
            subscriber_buffer: s.subscriber_buffer,
        }
    }
}

/// What happened to one ingested record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Something observable changed; a change event with `version` was published.
    Merged { identity: IdentityKey, version: u64 },
    /// Linked and stored, but nothing observable changed. No event.
    Unchanged { identity: IdentityKey, version: u64 },
    /// MalformedRecord: logged, audited, not stored.
    Dropped { reason: String },
}

impl IngestOutcome {
    pub fn identity(&self) -> Option<&IdentityKey> {
        match self {
            IngestOutcome::Merged { identity, .. } | IngestOutcome::Unchanged { identity, .. } => {
                Some(identity)
            }
            IngestOutcome::Dropped { .. } => None,
        }
    }
}

/// A query result: the current canonical batch, its timeline as of the
/// query, and the version of the last published change.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchView {
    pub batch: CanonicalBatch,
    pub timeline: Vec<LifecycleStep>,
    pub version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub identities: usize,
    pub records: usize,
    pub subscribers: usize,
    pub events_published: u64,
    pub records_dropped: u64,
}

// ---------------------------------------------------------------------------
// Per-identity state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BatchSlot {
    records: Vec<BatchRecord>,
    /// Union of every index snapshot seen by merges into this slot.
    entry: IdentityEntry,
    current: Option<Reconciled>,
    version: u64,
    /// Set once this identity was absorbed; its records moved to the survivor.
    retired: Option<IdentityKey>,
}

/// Fold `snapshot` into `acc`. Returns whether anything was added.
fn union_entry(acc: &mut IdentityEntry, snapshot: IdentityEntry) -> bool {
    let before = (
        acc.aliases.len(),
        acc.sources.len(),
        acc.absorbed.len(),
        acc.confidence,
    );
    acc.aliases.extend(snapshot.aliases);
    acc.sources.extend(snapshot.sources);
    acc.absorbed.extend(snapshot.absorbed);
    if snapshot.confidence == IdentityConfidence::Fuzzy {
        acc.confidence = IdentityConfidence::Fuzzy;
    }
    before
        != (
            acc.aliases.len(),
            acc.sources.len(),
            acc.absorbed.len(),
            acc.confidence,
        )
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// State shared between the engine handle and detached ingest tasks.
///
/// Lock order is index → slot. The index lock is held only while resolving
/// a record and handing out its slot; merges run under the slot lock alone,
/// so different identities merge in parallel and one identity merges in
/// arrival order.
struct Shared {
    index: Mutex<IdentityIndex>,
    slots: RwLock<BTreeMap<IdentityKey, Arc<Mutex<BatchSlot>>>>,
    notifier: Notifier,
    audit: Option<Mutex<AuditWriter>>,
    dropped: AtomicU64,
}

/// Concurrent reconciliation runtime.
///
/// Every ingest runs to completion on its own task. A caller that stops
/// waiting (timeout, dropped request) does not stop the merge, so records
/// moved out of an absorbed slot always land in the survivor.
pub struct Engine {
    shared: Arc<Shared>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                index: Mutex::new(IdentityIndex::new(options.fuzzy_min_len)),
                slots: RwLock::new(BTreeMap::new()),
                notifier: Notifier::new(options.subscriber_buffer),
                audit: None,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Build from typed settings, opening the audit log when one is configured.
    pub fn from_settings(settings: &EngineSettings) -> Result<Self> {
        let engine = Self::new(EngineOptions::from(settings));
        match &settings.audit_path {
            Some(path) => {
                let writer = AuditWriter::open(path, settings.audit_hash_chain)
                    .with_context(|| format!("open audit log {path}"))?;
                Ok(engine.with_audit(writer))
            }
            None => Ok(engine),
        }
    }

    /// Attach an audit log. Only takes effect before the first ingest.
    pub fn with_audit(mut self, writer: AuditWriter) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.audit = Some(Mutex::new(writer)),
            None => warn!(
                path = %writer.path().display(),
                "engine already in use; audit log not attached"
            ),
        }
        self
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Normalize a wire record and ingest it. `role_hint` is the role of the
    /// source it was read from.
    pub async fn ingest_raw(
        &self,
        raw: RawBatchRecord,
        role_hint: Option<SourceRole>,
    ) -> IngestOutcome {
        let ids = json!({
            "qrCode": raw.qr_code,
            "collectionId": raw.collection_id,
            "id": raw.id,
        });
        match normalize_record(raw, role_hint) {
            Ok(record) => self.ingest(record).await,
            Err(e) => self.drop_malformed(e.to_string(), role_hint, ids).await,
        }
    }

    /// Link `record` to its identity and merge it.
    pub async fn ingest(&self, record: BatchRecord) -> IngestOutcome {
        let shared = Arc::clone(&self.shared);
        detached(async move { shared.ingest(record).await }).await
    }

    /// Count, log and audit a record that never made it to normalization,
    /// e.g. a wire item that failed to decode. `ids` is whatever identifying
    /// data the caller could salvage.
    pub async fn drop_malformed(
        &self,
        reason: impl Into<String>,
        role: Option<SourceRole>,
        ids: Value,
    ) -> IngestOutcome {
        let shared = Arc::clone(&self.shared);
        let reason = reason.into();
        detached(async move { shared.drop_malformed(reason, role, ids).await }).await
    }

    pub(crate) async fn audit(
        &self,
        kind: AuditKind,
        identity: Option<&IdentityKey>,
        payload: Value,
    ) {
        self.shared.audit(kind, identity, payload).await;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Look up the current state for any external id or identity key.
    pub async fn get_batch_view(&self, external_id: &str) -> Result<BatchView, QueryError> {
        let not_found = || QueryError::NotFound {
            external_id: external_id.to_string(),
        };
        let mut key = self
            .shared
            .index
            .lock()
            .await
            .lookup(external_id)
            .ok_or_else(not_found)?;

        for _ in 0..MAX_REDIRECT_HOPS {
            let slot = self.shared.slots.read().await.get(&key).cloned();
            let Some(slot) = slot else {
                // Absorbed after lookup; follow the index redirect.
                match self.shared.index.lock().await.canonical(&key) {
                    Some(live) if live != key => {
                        key = live;
                        continue;
                    }
                    _ => break,
                }
            };
            let slot = slot.lock().await;
            if let Some(survivor) = &slot.retired {
                key = survivor.clone();
                continue;
            }
            let Some(current) = &slot.current else {
                break;
            };
            return Ok(BatchView {
                batch: current.batch.clone(),
                timeline: synthesize(&current.batch, Utc::now()),
                version: slot.version,
            });
        }
        Err(not_found())
    }

    pub async fn get_canonical_batch(
        &self,
        external_id: &str,
    ) -> Result<CanonicalBatch, QueryError> {
        Ok(self.get_batch_view(external_id).await?.batch)
    }

    pub async fn get_timeline(&self, external_id: &str) -> Result<Vec<LifecycleStep>, QueryError> {
        Ok(self.get_batch_view(external_id).await?.timeline)
    }

    /// Live identity key for an external id, without requiring records.
    pub async fn resolve_key(&self, external_id: &str) -> Option<IdentityKey> {
        self.shared.index.lock().await.lookup(external_id)
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.shared.notifier.subscribe(filter).await
    }

    /// Subscribe to the identity currently linked to `external_id`.
    pub async fn subscribe_to(&self, external_id: &str) -> Result<Subscription, QueryError> {
        let key = self
            .resolve_key(external_id)
            .await
            .ok_or_else(|| QueryError::NotFound {
                external_id: external_id.to_string(),
            })?;
        Ok(self.subscribe(SubscriptionFilter::Identity(key)).await)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub async fn stats(&self) -> EngineStats {
        let identities = self.shared.index.lock().await.len();
        let slots: Vec<Arc<Mutex<BatchSlot>>> =
            self.shared.slots.read().await.values().cloned().collect();
        let mut records = 0;
        for slot in slots {
            records += slot.lock().await.records.len();
        }
        EngineStats {
            identities,
            records,
            subscribers: self.shared.notifier.subscriber_count().await,
            events_published: self.shared.notifier.published(),
            records_dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingest internals
// ---------------------------------------------------------------------------

/// Run an ingest step on its own task and wait for it. The step finishes
/// even if this future is dropped.
async fn detached<F>(step: F) -> IngestOutcome
where
    F: Future<Output = IngestOutcome> + Send + 'static,
{
    match tokio::spawn(step).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => IngestOutcome::Dropped {
            reason: format!("ingest task aborted: {e}"),
        },
    }
}

impl Shared {
    async fn ingest(&self, record: BatchRecord) -> IngestOutcome {
        let mut carried: Vec<BatchRecord> = Vec::new();
        loop {
            let (resolution, snapshot, slot) = {
                let mut index = self.index.lock().await;
                let resolution = match index.resolve(&record) {
                    Ok(r) => r,
                    Err(e) => {
                        drop(index);
                        return self
                            .drop_malformed(e.to_string(), Some(record.source_role), Value::Null)
                            .await;
                    }
                };
                if resolution.is_ambiguous() {
                    carried.extend(self.retire(&resolution.absorbed, &resolution.identity).await);
                }
                let snapshot = index.entry(&resolution.identity).cloned().unwrap_or_default();
                let slot = self.slot_for(&resolution.identity).await;
                (resolution, snapshot, slot)
            };

            if resolution.is_ambiguous() {
                let absorbed: Vec<&str> = resolution.absorbed.iter().map(|k| k.as_str()).collect();
                warn!(
                    identity = %resolution.identity,
                    absorbed = ?absorbed,
                    source = %record.source_role,
                    "ambiguous identity; merged"
                );
                self.audit(
                    AuditKind::AmbiguousIdentity,
                    Some(&resolution.identity),
                    json!({
                        "survivor": resolution.identity,
                        "absorbed": resolution.absorbed,
                        "external_ids": record.external_ids,
                        "source": record.source_role,
                    }),
                )
                .await;
            }

            let mut slot = slot.lock().await;
            if let Some(survivor) = &slot.retired {
                // Absorbed between resolve and lock; resolve again.
                debug!(
                    identity = %resolution.identity,
                    survivor = %survivor,
                    "slot retired; retrying"
                );
                continue;
            }
            return self
                .merge_into(&resolution.identity, &mut slot, snapshot, carried, record)
                .await;
        }
    }

    async fn slot_for(&self, key: &IdentityKey) -> Arc<Mutex<BatchSlot>> {
        let mut slots = self.slots.write().await;
        slots.entry(key.clone()).or_default().clone()
    }

    /// Retire absorbed slots and hand back their records. Caller holds the
    /// index lock.
    async fn retire(&self, absorbed: &[IdentityKey], survivor: &IdentityKey) -> Vec<BatchRecord> {
        let mut moved = Vec::new();
        for key in absorbed {
            let slot = self.slots.write().await.remove(key);
            let Some(slot) = slot else {
                continue;
            };
            let mut slot = slot.lock().await;
            slot.retired = Some(survivor.clone());
            moved.append(&mut slot.records);
        }
        moved
    }

    async fn merge_into(
        &self,
        identity: &IdentityKey,
        slot: &mut BatchSlot,
        snapshot: IdentityEntry,
        carried: Vec<BatchRecord>,
        record: BatchRecord,
    ) -> IngestOutcome {
        let entry_grew = union_entry(&mut slot.entry, snapshot);
        let mut added = 0usize;
        for r in carried.into_iter().chain(std::iter::once(record)) {
            if !slot.records.contains(&r) {
                slot.records.push(r);
                added += 1;
            }
        }
        if added == 0 && !entry_grew && slot.current.is_some() {
            return IngestOutcome::Unchanged {
                identity: identity.clone(),
                version: slot.version,
            };
        }

        let now = Utc::now();
        let Some(next) = reconcile_batch(identity, &slot.entry, &slot.records, now) else {
            return IngestOutcome::Unchanged {
                identity: identity.clone(),
                version: slot.version,
            };
        };
        let changes = diff_observable(slot.current.as_ref(), &next);
        let conflict_changed = next.batch.terminal_conflict.is_some()
            && slot.current.as_ref().map(|c| &c.batch.terminal_conflict)
                != Some(&next.batch.terminal_conflict);
        slot.current = Some(next);

        if changes.is_empty() {
            return IngestOutcome::Unchanged {
                identity: identity.clone(),
                version: slot.version,
            };
        }
        slot.version += 1;

        let Some(current) = &slot.current else {
            return IngestOutcome::Unchanged {
                identity: identity.clone(),
                version: slot.version,
            };
        };
        if conflict_changed {
            if let Some(conflict) = &current.batch.terminal_conflict {
                warn!(
                    identity = %identity,
                    winner = conflict.winner.as_str(),
                    superseded = conflict.superseded.len(),
                    "conflicting terminal status"
                );
                let payload = serde_json::to_value(conflict).unwrap_or(Value::Null);
                self.audit(AuditKind::ConflictingTerminal, Some(identity), payload)
                    .await;
            }
        }

        let event = ChangeEvent {
            identity: identity.clone(),
            version: slot.version,
            batch: current.batch.clone(),
            timeline: current.timeline.clone(),
            emitted_at: now,
        };
        let delivered = self.notifier.publish(&event).await;
        info!(
            identity = %identity,
            version = slot.version,
            status = current.batch.status.as_str(),
            changes = changes.len(),
            delivered,
            "batch merged"
        );
        IngestOutcome::Merged {
            identity: identity.clone(),
            version: slot.version,
        }
    }

    async fn drop_malformed(
        &self,
        reason: String,
        role: Option<SourceRole>,
        ids: Value,
    ) -> IngestOutcome {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(source = ?role, reason = %reason, "malformed record dropped");
        self.audit(
            AuditKind::MalformedRecord,
            None,
            json!({ "reason": reason, "source": role, "ids": ids }),
        )
        .await;
        IngestOutcome::Dropped { reason }
    }

    async fn audit(&self, kind: AuditKind, identity: Option<&IdentityKey>, payload: Value) {
        let Some(audit) = &self.audit else {
            return;
        };
        let mut writer = audit.lock().await;
        if let Err(e) = writer.append(kind, identity.map(|k| k.as_str()), payload) {
            warn!(kind = kind.as_str(), error = %e, "audit append failed");
        }
    }
}
