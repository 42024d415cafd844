//! Change notifier: fan-out of [`ChangeEvent`]s to subscribers.
//!
//! Each subscriber owns a bounded channel. Publishing never waits on a
//! subscriber: `try_send` either enqueues or the subscriber is dropped.
//! A subscriber that cannot keep up is evicted rather than allowed to stall
//! merges for every identity.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use hbt_reconcile::{VersionFreshness, VersionWatermark};
use hbt_schemas::{ChangeEvent, IdentityKey};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    /// One identity. Also matches after that key is absorbed into another.
    Identity(IdentityKey),
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Identity(key) => {
                event.identity == *key || event.batch.absorbed_identities.contains(key)
            }
        }
    }
}

struct Subscriber {
    id: u64,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<ChangeEvent>,
}

pub struct Notifier {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    buffer: usize,
    published: AtomicU64,
}

impl Notifier {
    /// `buffer` is the per-subscriber channel capacity (minimum 1).
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
        }
    }

    pub async fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().await.push(Subscriber {
            id,
            filter: filter.clone(),
            tx,
        });
        debug!(subscriber = id, ?filter, "subscribed");
        Subscription {
            id,
            filter,
            rx,
            watermark: VersionWatermark::new(),
        }
    }

    /// Deliver `event` to every matching subscriber. Returns how many
    /// subscribers received it.
    pub async fn publish(&self, event: &ChangeEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        let mut subs = self.subscribers.lock().await;
        subs.retain(|s| {
            if !s.filter.matches(event) {
                return !s.tx.is_closed();
            }
            match s.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber = s.id,
                        identity = %event.identity,
                        version = event.version,
                        "subscriber buffer full; evicting"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = s.id, "subscriber gone");
                    false
                }
            }
        });
        delivered
    }

    /// Live subscribers. Prunes the ones whose receiver was dropped.
    pub async fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|s| !s.tx.is_closed());
        subs.len()
    }

    /// Total events handed to `publish` since start.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Receiving end of one subscription.
///
/// The channel closes when the subscriber is evicted; `recv` then drains what
/// was buffered and returns `None`.
pub struct Subscription {
    id: u64,
    filter: SubscriptionFilter,
    rx: mpsc::Receiver<ChangeEvent>,
    watermark: VersionWatermark,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// Next event as delivered, duplicates included.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Next event whose version is newer than anything already returned for
    /// its identity. Duplicate and stale deliveries are skipped.
    pub async fn next_fresh(&mut self) -> Option<ChangeEvent> {
        while let Some(ev) = self.rx.recv().await {
            match self.watermark.accept(&ev) {
                VersionFreshness::Fresh => return Some(ev),
                VersionFreshness::Gap { expected, got } => {
                    debug!(identity = %ev.identity, expected, got, "version gap");
                    return Some(ev);
                }
                VersionFreshness::Duplicate | VersionFreshness::Stale { .. } => continue,
            }
        }
        None
    }

    pub fn into_stream(self) -> ReceiverStream<ChangeEvent> {
        ReceiverStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hbt_schemas::{BatchStatus, CanonicalBatch, IdentityConfidence};
    use std::collections::{BTreeMap, BTreeSet};

    fn event(identity: &str, version: u64) -> ChangeEvent {
        ChangeEvent {
            identity: IdentityKey::new(identity),
            version,
            batch: CanonicalBatch {
                identity: IdentityKey::new(identity),
                status: BatchStatus::Pending,
                status_source: None,
                merged_fields: BTreeMap::new(),
                created_at: None,
                last_updated: None,
                contributing_sources: BTreeSet::new(),
                external_ids: BTreeSet::new(),
                absorbed_identities: BTreeSet::new(),
                identity_confidence: IdentityConfidence::Exact,
                terminal_conflict: None,
            },
            timeline: Vec::new(),
            emitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn identity_filter_only_sees_its_identity() {
        let n = Notifier::new(8);
        let mut all = n.subscribe(SubscriptionFilter::All).await;
        let mut one = n
            .subscribe(SubscriptionFilter::Identity(IdentityKey::new("A")))
            .await;

        n.publish(&event("A", 1)).await;
        n.publish(&event("B", 1)).await;

        assert_eq!(all.try_recv().map(|e| e.identity.0), Some("A".into()));
        assert_eq!(all.try_recv().map(|e| e.identity.0), Some("B".into()));
        assert_eq!(one.try_recv().map(|e| e.identity.0), Some("A".into()));
        assert!(one.try_recv().is_none());
    }

    #[tokio::test]
    async fn identity_filter_follows_absorbed_key() {
        let n = Notifier::new(8);
        let mut sub = n
            .subscribe(SubscriptionFilter::Identity(IdentityKey::new("B")))
            .await;
        let mut ev = event("A", 3);
        ev.batch.absorbed_identities.insert(IdentityKey::new("B"));
        assert_eq!(n.publish(&ev).await, 1);
        assert_eq!(sub.try_recv().map(|e| e.version), Some(3));
    }

    #[tokio::test]
    async fn full_subscriber_is_evicted_without_blocking() {
        let n = Notifier::new(1);
        let mut slow = n.subscribe(SubscriptionFilter::All).await;
        let mut fast = n.subscribe(SubscriptionFilter::All).await;

        n.publish(&event("A", 1)).await;
        assert!(fast.try_recv().is_some());
        // slow never drained: the second publish finds its buffer full.
        n.publish(&event("A", 2)).await;
        assert_eq!(n.subscriber_count().await, 1);
        assert_eq!(fast.try_recv().map(|e| e.version), Some(2));

        assert_eq!(slow.recv().await.map(|e| e.version), Some(1));
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let n = Notifier::new(4);
        let sub = n.subscribe(SubscriptionFilter::All).await;
        assert_eq!(n.subscriber_count().await, 1);
        drop(sub);
        assert_eq!(n.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn next_fresh_skips_duplicates_and_stale_versions() {
        let n = Notifier::new(8);
        let mut sub = n.subscribe(SubscriptionFilter::All).await;
        for v in [1, 1, 2, 1, 4] {
            n.publish(&event("A", v)).await;
        }
        n.subscribers.lock().await.clear();

        let mut seen = Vec::new();
        while let Some(ev) = sub.next_fresh().await {
            seen.push(ev.version);
        }
        assert_eq!(seen, vec![1, 2, 4]);
    }
}
