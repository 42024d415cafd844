//! Change-event version watermark
//!
//! Subscribers may see a change event more than once (at-least-once delivery)
//! and, after resubscribing, may see versions they already applied.  This
//! module tracks the last accepted version per identity so consumers can drop
//! duplicates and stale re-deliveries.
//!
//! # Invariants
//!
//! - **Non-decreasing**: an event is accepted only if its version is strictly
//!   greater than the last accepted version for its identity.
//! - **Gaps are accepted**: a jump (e.g. 3 → 5) means intermediate events were
//!   missed; every event carries the full batch, so the newer one is applied
//!   and the gap is reported for logging.
//! - **Watermark advances only on acceptance**.
//! - **Identities are independent**: no cross-identity ordering is assumed.

use std::collections::BTreeMap;

use hbt_schemas::{ChangeEvent, IdentityKey};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionFreshness {
    /// Next expected version (or first seen for this identity).
    Fresh,
    /// Newer than expected; `expected..got` were never seen. Still applied.
    Gap { expected: u64, got: u64 },
    /// Same version as the last accepted one.
    Duplicate,
    /// Older than the last accepted version.
    Stale { watermark: u64, got: u64 },
}

impl VersionFreshness {
    /// `true` for `Fresh` and `Gap`: the event should be applied.
    pub fn is_applicable(&self) -> bool {
        matches!(self, VersionFreshness::Fresh | VersionFreshness::Gap { .. })
    }
}

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

/// Per-identity last-accepted version.
///
/// Call [`accept`][VersionWatermark::accept] on each event and apply it only
/// when the result [`is_applicable`][VersionFreshness::is_applicable].
/// [`check`][VersionWatermark::check] is the read-only variant.
#[derive(Clone, Debug, Default)]
pub struct VersionWatermark {
    last: BTreeMap<IdentityKey, u64>,
}

impl VersionWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_version(&self, identity: &IdentityKey, version: u64) -> VersionFreshness {
        match self.last.get(identity).copied() {
            None => VersionFreshness::Fresh,
            Some(w) if version == w => VersionFreshness::Duplicate,
            Some(w) if version < w => VersionFreshness::Stale {
                watermark: w,
                got: version,
            },
            Some(w) if version == w + 1 => VersionFreshness::Fresh,
            Some(w) => VersionFreshness::Gap {
                expected: w + 1,
                got: version,
            },
        }
    }

    pub fn check(&self, event: &ChangeEvent) -> VersionFreshness {
        self.check_version(&event.identity, event.version)
    }

    /// Check and advance the watermark when the event is applicable.
    pub fn accept(&mut self, event: &ChangeEvent) -> VersionFreshness {
        let result = self.check(event);
        if result.is_applicable() {
            self.last.insert(event.identity.clone(), event.version);
        }
        result
    }

    /// Last accepted version for `identity`, if any.
    pub fn last_accepted(&self, identity: &IdentityKey) -> Option<u64> {
        self.last.get(identity).copied()
    }
}
