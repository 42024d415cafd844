//! hbt-engine
//!
//! Concurrent runtime around the pure `hbt-reconcile` pipeline.
//!
//! - One [`Engine`] holds the identity index, a per-identity record store,
//!   the change notifier and an optional audit writer.
//! - `ingest` / `ingest_raw` resolve, store, re-reconcile and publish.
//!   Malformed records are dropped with a warning and an audit entry; they
//!   never surface as errors.
//! - Queries accept any linked external id or identity key.
//! - `resync` is just another producer feeding the same ingestion path.

mod engine;
mod error;
mod notifier;
mod resync;

pub use engine::{BatchView, Engine, EngineOptions, EngineStats, IngestOutcome};
pub use error::QueryError;
pub use notifier::{Notifier, Subscription, SubscriptionFilter};
pub use resync::ResyncReport;
