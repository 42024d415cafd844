//! Identity Resolver
//!
//! Maps the heterogeneous identifiers participants attach to a batch
//! (`qrCode`, `collectionId`, `id`) onto one stable [`IdentityKey`].
//!
//! # Invariants
//!
//! - **Exact before fuzzy**: a fuzzy (suffix / substring) match is attempted
//!   only when none of the record's ids is already known.
//! - **Never split**: once ids are linked to an identity they stay linked.
//!   When a record straddles several identities they are merged into one
//!   survivor and the absorbed keys redirect to it forever.
//! - **Deterministic survivor**: most prior contributing sources wins, ties go
//!   to the lexicographically smallest key.
//! - **Deterministic keys**: a new identity's key is a v5 UUID of the smallest
//!   external id of the record that created it.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use hbt_schemas::{BatchRecord, IdentityConfidence, IdentityKey, SourceRole};

/// Namespace for identity keys derived from external ids.
const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_8d4a_4e57_9a0b_5c7d_2e91_f4a3);

/// Default minimum id length eligible for fuzzy matching. Shorter ids match
/// too many unrelated aliases by substring.
pub const DEFAULT_FUZZY_MIN_LEN: usize = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The record carries no usable external id; it must be dropped.
    NoExternalId,
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::NoExternalId => {
                write!(f, "malformed record: no external id to resolve")
            }
        }
    }
}

impl std::error::Error for ResolveError {}

// ---------------------------------------------------------------------------
// Resolution result
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchKind {
    /// At least one id matched a known alias exactly.
    Exact,
    /// No exact match; attached through suffix / substring similarity.
    Fuzzy,
    /// Nothing matched; a new identity was created.
    Created,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub identity: IdentityKey,
    pub match_kind: MatchKind,
    /// Identities merged into `identity` by this resolution (AmbiguousIdentity).
    pub absorbed: Vec<IdentityKey>,
}

impl Resolution {
    pub fn is_ambiguous(&self) -> bool {
        !self.absorbed.is_empty()
    }
}

/// Everything known about one live identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityEntry {
    pub aliases: BTreeSet<String>,
    pub sources: BTreeSet<SourceRole>,
    pub confidence: IdentityConfidence,
    pub absorbed: BTreeSet<IdentityKey>,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Mapping from every known external id to its live identity.
#[derive(Clone, Debug)]
pub struct IdentityIndex {
    aliases: BTreeMap<String, IdentityKey>,
    entries: BTreeMap<IdentityKey, IdentityEntry>,
    /// Absorbed key → survivor. Always points at a live key.
    redirects: BTreeMap<IdentityKey, IdentityKey>,
    fuzzy_min_len: usize,
}

impl Default for IdentityIndex {
    fn default() -> Self {
        Self::new(DEFAULT_FUZZY_MIN_LEN)
    }
}

impl IdentityIndex {
    pub fn new(fuzzy_min_len: usize) -> Self {
        Self {
            aliases: BTreeMap::new(),
            entries: BTreeMap::new(),
            redirects: BTreeMap::new(),
            fuzzy_min_len,
        }
    }

    /// Number of live identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &IdentityKey) -> Option<&IdentityEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.entries.keys()
    }

    /// Follow redirects from any key (live or absorbed) to the live key.
    pub fn canonical(&self, key: &IdentityKey) -> Option<IdentityKey> {
        if self.entries.contains_key(key) {
            return Some(key.clone());
        }
        self.redirects.get(key).cloned()
    }

    /// Exact lookup by external id or identity key. Never fuzzy.
    pub fn lookup(&self, id: &str) -> Option<IdentityKey> {
        let id = id.trim();
        if let Some(key) = self.aliases.get(id) {
            return Some(key.clone());
        }
        self.canonical(&IdentityKey::new(id))
    }

    /// Resolve a record to its identity, creating or merging identities as
    /// needed, and register the record's ids and role on it.
    pub fn resolve(&mut self, record: &BatchRecord) -> Result<Resolution, ResolveError> {
        let ids: BTreeSet<String> = record
            .external_ids
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let Some(smallest_id) = ids.iter().next().cloned() else {
            return Err(ResolveError::NoExternalId);
        };

        let exact: BTreeSet<IdentityKey> =
            ids.iter().filter_map(|id| self.aliases.get(id).cloned()).collect();

        let (identity, match_kind, absorbed) = if !exact.is_empty() {
            let survivor = self.pick_survivor(&exact);
            let absorbed: Vec<IdentityKey> =
                exact.into_iter().filter(|k| *k != survivor).collect();
            for k in &absorbed {
                self.absorb(&survivor, k);
            }
            (survivor, MatchKind::Exact, absorbed)
        } else if let Some(key) = self.fuzzy_candidate(&ids) {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.confidence = IdentityConfidence::Fuzzy;
            }
            (key, MatchKind::Fuzzy, Vec::new())
        } else {
            let key = self.fresh_key(&smallest_id);
            self.entries.insert(key.clone(), IdentityEntry::default());
            (key, MatchKind::Created, Vec::new())
        };

        if let Some(entry) = self.entries.get_mut(&identity) {
            entry.sources.insert(record.source_role);
            for id in &ids {
                entry.aliases.insert(id.clone());
            }
        }
        for id in ids {
            self.aliases.insert(id, identity.clone());
        }

        Ok(Resolution {
            identity,
            match_kind,
            absorbed,
        })
    }

    /// Most prior sources wins; ties go to the smallest key.
    fn pick_survivor(&self, candidates: &BTreeSet<IdentityKey>) -> IdentityKey {
        let mut best: Option<(&IdentityKey, usize)> = None;
        // BTreeSet iterates keys ascending, so strict `>` keeps the smallest on ties.
        for key in candidates {
            let n = self.entries.get(key).map(|e| e.sources.len()).unwrap_or(0);
            match best {
                Some((_, best_n)) if n <= best_n => {}
                _ => best = Some((key, n)),
            }
        }
        best.map(|(k, _)| k.clone())
            .unwrap_or_else(|| IdentityKey::new(""))
    }

    fn absorb(&mut self, survivor: &IdentityKey, absorbed: &IdentityKey) {
        let Some(old) = self.entries.remove(absorbed) else {
            return;
        };
        for alias in &old.aliases {
            self.aliases.insert(alias.clone(), survivor.clone());
        }
        for target in self.redirects.values_mut() {
            if target == absorbed {
                *target = survivor.clone();
            }
        }
        self.redirects.insert(absorbed.clone(), survivor.clone());

        if let Some(entry) = self.entries.get_mut(survivor) {
            entry.aliases.extend(old.aliases);
            entry.sources.extend(old.sources);
            entry.absorbed.extend(old.absorbed);
            entry.absorbed.insert(absorbed.clone());
            if old.confidence == IdentityConfidence::Fuzzy {
                entry.confidence = IdentityConfidence::Fuzzy;
            }
        }
    }

    fn fuzzy_candidate(&self, ids: &BTreeSet<String>) -> Option<IdentityKey> {
        let min = self.fuzzy_min_len;
        let mut candidates = BTreeSet::new();
        for id in ids.iter().filter(|id| id.len() >= min) {
            for (alias, key) in self.aliases.iter().filter(|(a, _)| a.len() >= min) {
                if alias.contains(id.as_str()) || id.contains(alias.as_str()) {
                    candidates.insert(key.clone());
                }
            }
        }
        if candidates.is_empty() {
            None
        } else {
            Some(self.pick_survivor(&candidates))
        }
    }

    fn fresh_key(&self, seed: &str) -> IdentityKey {
        let base = format!(
            "BATCH-{}",
            Uuid::new_v5(&IDENTITY_NAMESPACE, seed.as_bytes()).simple()
        );
        let mut key = IdentityKey::new(base.clone());
        let mut n = 1;
        while self.entries.contains_key(&key) || self.redirects.contains_key(&key) {
            n += 1;
            key = IdentityKey::new(format!("{base}-{n}"));
        }
        key
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hbt_schemas::BatchStatus;

    fn rec(role: SourceRole, ids: &[&str]) -> BatchRecord {
        let mut r = BatchRecord::new(role, BatchStatus::Pending);
        for id in ids {
            r = r.with_id(*id);
        }
        r
    }

    #[test]
    fn unknown_ids_create_an_identity() {
        let mut idx = IdentityIndex::default();
        let res = idx.resolve(&rec(SourceRole::Originator, &["Q1"])).unwrap();
        assert_eq!(res.match_kind, MatchKind::Created);
        assert!(res.identity.as_str().starts_with("BATCH-"));
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.lookup("Q1"), Some(res.identity));
    }

    #[test]
    fn key_is_deterministic_for_the_same_creating_id() {
        let mut a = IdentityIndex::default();
        let mut b = IdentityIndex::default();
        let ka = a.resolve(&rec(SourceRole::Originator, &["Q1"])).unwrap();
        let kb = b.resolve(&rec(SourceRole::Processor, &["Q1"])).unwrap();
        assert_eq!(ka.identity, kb.identity);
    }

    #[test]
    fn any_exact_id_links_and_extends_aliases() {
        let mut idx = IdentityIndex::default();
        let first = idx.resolve(&rec(SourceRole::Originator, &["Q1"])).unwrap();
        let second = idx
            .resolve(&rec(SourceRole::Processor, &["Q1", "COL-9"]))
            .unwrap();
        assert_eq!(second.match_kind, MatchKind::Exact);
        assert_eq!(first.identity, second.identity);
        assert_eq!(idx.lookup("COL-9"), Some(first.identity.clone()));

        let entry = idx.entry(&first.identity).unwrap();
        assert_eq!(entry.sources.len(), 2);
    }

    #[test]
    fn record_without_ids_is_rejected_and_creates_nothing() {
        let mut idx = IdentityIndex::default();
        let r = rec(SourceRole::Originator, &["  "]);
        assert_eq!(idx.resolve(&r), Err(ResolveError::NoExternalId));
        assert!(idx.is_empty());
    }

    #[test]
    fn straddling_record_merges_into_identity_with_more_sources() {
        let mut idx = IdentityIndex::default();
        let a = idx.resolve(&rec(SourceRole::Originator, &["QR-A"])).unwrap();
        idx.resolve(&rec(SourceRole::Processor, &["QR-A"])).unwrap();
        let b = idx.resolve(&rec(SourceRole::Laboratory, &["COL-B"])).unwrap();
        assert_ne!(a.identity, b.identity);

        let res = idx
            .resolve(&rec(SourceRole::Regulator, &["QR-A", "COL-B"]))
            .unwrap();
        assert!(res.is_ambiguous());
        assert_eq!(res.identity, a.identity, "two sources beat one");
        assert_eq!(res.absorbed, vec![b.identity.clone()]);

        assert_eq!(idx.len(), 1);
        assert_eq!(idx.lookup("COL-B"), Some(a.identity.clone()));
        assert_eq!(idx.canonical(&b.identity), Some(a.identity.clone()));
        let entry = idx.entry(&a.identity).unwrap();
        assert_eq!(entry.sources.len(), 4);
        assert!(entry.absorbed.contains(&b.identity));
    }

    #[test]
    fn ambiguous_tie_goes_to_smallest_key() {
        let mut idx = IdentityIndex::default();
        let a = idx.resolve(&rec(SourceRole::Originator, &["ID-ONE"])).unwrap();
        let b = idx.resolve(&rec(SourceRole::Originator, &["ID-TWO"])).unwrap();
        let expected = std::cmp::min(a.identity.clone(), b.identity.clone());

        let res = idx
            .resolve(&rec(SourceRole::Processor, &["ID-ONE", "ID-TWO"]))
            .unwrap();
        assert_eq!(res.identity, expected);
    }

    #[test]
    fn redirects_follow_chained_absorptions() {
        let mut idx = IdentityIndex::default();
        let a = idx.resolve(&rec(SourceRole::Originator, &["AAAA"])).unwrap();
        idx.resolve(&rec(SourceRole::Processor, &["AAAA"])).unwrap();
        idx.resolve(&rec(SourceRole::Laboratory, &["AAAA"])).unwrap();
        idx.resolve(&rec(SourceRole::Regulator, &["AAAA"])).unwrap();
        let b = idx.resolve(&rec(SourceRole::Originator, &["BBBB"])).unwrap();
        idx.resolve(&rec(SourceRole::Processor, &["BBBB"])).unwrap();
        let c = idx.resolve(&rec(SourceRole::Originator, &["CCCC"])).unwrap();

        // c absorbed into b, then b absorbed into a.
        idx.resolve(&rec(SourceRole::Regulator, &["BBBB", "CCCC"])).unwrap();
        idx.resolve(&rec(SourceRole::Regulator, &["AAAA", "BBBB"])).unwrap();

        assert_eq!(idx.canonical(&c.identity), Some(a.identity.clone()));
        assert_eq!(idx.canonical(&b.identity), Some(a.identity.clone()));
        assert_eq!(idx.lookup("CCCC"), Some(a.identity));
    }

    #[test]
    fn fuzzy_match_only_without_exact_and_is_flagged() {
        let mut idx = IdentityIndex::default();
        let a = idx
            .resolve(&rec(SourceRole::Originator, &["COL-2024-0001"]))
            .unwrap();

        let res = idx
            .resolve(&rec(SourceRole::Processor, &["HERB-COL-2024-0001"]))
            .unwrap();
        assert_eq!(res.match_kind, MatchKind::Fuzzy);
        assert_eq!(res.identity, a.identity);
        assert_eq!(
            idx.entry(&a.identity).unwrap().confidence,
            IdentityConfidence::Fuzzy
        );
        // The fuzzy id is now a known alias and matches exactly next time.
        let again = idx
            .resolve(&rec(SourceRole::Laboratory, &["HERB-COL-2024-0001"]))
            .unwrap();
        assert_eq!(again.match_kind, MatchKind::Exact);
    }

    #[test]
    fn short_ids_never_fuzzy_match() {
        let mut idx = IdentityIndex::default();
        let a = idx.resolve(&rec(SourceRole::Originator, &["Q1"])).unwrap();
        let b = idx.resolve(&rec(SourceRole::Processor, &["XQ1"])).unwrap();
        assert_ne!(a.identity, b.identity);
        assert_eq!(b.match_kind, MatchKind::Created);
    }

    #[test]
    fn lookup_is_exact_and_accepts_identity_keys() {
        let mut idx = IdentityIndex::default();
        let a = idx
            .resolve(&rec(SourceRole::Originator, &["COL-2024-0001"]))
            .unwrap();
        assert_eq!(idx.lookup("2024-0001"), None);
        assert_eq!(idx.lookup(a.identity.as_str()), Some(a.identity.clone()));
        assert_eq!(idx.lookup(" COL-2024-0001 "), Some(a.identity));
    }
}
