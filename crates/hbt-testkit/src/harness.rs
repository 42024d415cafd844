use std::sync::Arc;

use hbt_engine::{Engine, EngineOptions, IngestOutcome, Subscription, SubscriptionFilter};
use hbt_schemas::{BatchRecord, ChangeEvent};

/// An engine plus one catch-all subscription sized so tests never trip
/// eviction.
pub struct EngineHarness {
    pub engine: Arc<Engine>,
    events: Subscription,
}

impl EngineHarness {
    pub async fn new() -> Self {
        let engine = Arc::new(Engine::new(EngineOptions {
            subscriber_buffer: 65_536,
            ..EngineOptions::default()
        }));
        let events = engine.subscribe(SubscriptionFilter::All).await;
        Self { engine, events }
    }

    pub async fn ingest_all(
        &self,
        records: impl IntoIterator<Item = BatchRecord>,
    ) -> Vec<IngestOutcome> {
        let mut out = Vec::new();
        for r in records {
            out.push(self.engine.ingest(r).await);
        }
        out
    }

    /// Every event published since the last drain, in delivery order.
    pub fn drain_events(&mut self) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}
