//! hbt-audit
//!
//! Reviewable trail of every anomaly the engine resolved on its own
//! (ambiguous links, overruled terminal statuses, skipped sources, dropped
//! records). One JSON object per line in an append-only file.
//!
//! With chaining on, each event stores the previous event's digest and its
//! own, so [`verify_hash_chain`] finds edited, removed or reordered lines.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x2d8e_51c0_7a4b_4f19_b3e6_90c1_4a7f_d025);

/// Chain anchor used in event-id derivation before the first event.
const GENESIS: &str = "GENESIS";

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    AmbiguousIdentity,
    ConflictingTerminal,
    MalformedRecord,
    SourceUnavailable,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::AmbiguousIdentity => "AMBIGUOUS_IDENTITY",
            AuditKind::ConflictingTerminal => "CONFLICTING_TERMINAL",
            AuditKind::MalformedRecord => "MALFORMED_RECORD",
            AuditKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Derived from chain position and payload, never random.
    pub event_id: Uuid,
    /// Random per writer; tells daemon lifetimes apart within one file.
    pub stream_id: Uuid,
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    pub kind: AuditKind,
    pub identity: Option<String>,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Digest of `ev` as stored, minus its own `hash_self`.
pub fn compute_event_hash(ev: &AuditEvent) -> Result<String> {
    let unsealed = AuditEvent {
        hash_self: None,
        ..ev.clone()
    };
    let digest = Sha256::digest(canonical_json(&unsealed)?.as_bytes());
    Ok(hex::encode(digest))
}

/// Compact JSON with object keys in sorted order. `serde_json::Map` keeps
/// keys sorted, so a round trip through `Value` is enough.
fn canonical_json<T: Serialize>(v: &T) -> Result<String> {
    let value = serde_json::to_value(v).context("encode audit event")?;
    serde_json::to_string(&value).context("stringify audit event")
}

fn derive_event_id(prev_hash: Option<&str>, seq: u64, payload: &Value) -> Result<Uuid> {
    let seed = format!(
        "{}|{seq}|{}",
        prev_hash.unwrap_or(GENESIS),
        canonical_json(payload)?
    );
    Ok(Uuid::new_v5(&EVENT_ID_NAMESPACE, seed.as_bytes()))
}

/// Non-empty lines of a log with their 1-based line numbers, parsed.
fn parse_events(content: &str) -> impl Iterator<Item = Result<(usize, AuditEvent)>> + '_ {
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l.trim())
                .map(|ev| (i + 1, ev))
                .with_context(|| format!("parse audit event at line {}", i + 1))
        })
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    stream_id: Uuid,
    last_hash: Option<String>,
    /// Events already in the file, which is also the next `seq`.
    seq: u64,
}

impl AuditWriter {
    /// Writer that starts a new chain at `path`. Parent directories are
    /// created. Lines already in the file are not chained onto; see
    /// [`AuditWriter::open`].
    pub fn new(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create audit dir {}", dir.display()))?;
        }
        Ok(Self {
            path,
            hash_chain,
            stream_id: Uuid::new_v4(),
            last_hash: None,
            seq: 0,
        })
    }

    /// Writer that continues the chain already in `path`, if any.
    pub fn open(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let mut writer = Self::new(path, hash_chain)?;
        if !writer.path.exists() {
            return Ok(writer);
        }
        let content = fs::read_to_string(&writer.path)
            .with_context(|| format!("read audit log {}", writer.path.display()))?;
        for parsed in parse_events(&content) {
            let (_, ev) = parsed?;
            writer.seq += 1;
            writer.last_hash = ev.hash_self;
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn append(
        &mut self,
        kind: AuditKind,
        identity: Option<&str>,
        payload: Value,
    ) -> Result<AuditEvent> {
        let mut ev = AuditEvent {
            event_id: derive_event_id(self.last_hash.as_deref(), self.seq, &payload)?,
            stream_id: self.stream_id,
            seq: self.seq,
            ts_utc: Utc::now(),
            kind,
            identity: identity.map(str::to_string),
            payload,
            hash_prev: None,
            hash_self: None,
        };
        if self.hash_chain {
            ev.hash_prev = self.last_hash.clone();
            ev.hash_self = Some(compute_event_hash(&ev)?);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        writeln!(file, "{}", canonical_json(&ev)?).context("append audit event")?;

        if self.hash_chain {
            self.last_hash = ev.hash_self.clone();
        }
        self.seq += 1;
        Ok(ev)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    /// First bad event, 1-based line number.
    Broken { line: usize, reason: String },
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    verify_hash_chain_str(&content)
}

/// [`verify_hash_chain`] over JSONL already in memory.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut expected_prev: Option<String> = None;
    let mut lines = 0usize;

    for parsed in parse_events(content) {
        let (line, ev) = parsed?;
        lines += 1;

        if ev.hash_prev != expected_prev {
            return Ok(VerifyResult::Broken {
                line,
                reason: format!(
                    "hash_prev mismatch: expected {expected_prev:?}, got {:?}",
                    ev.hash_prev
                ),
            });
        }
        if let Some(claimed) = &ev.hash_self {
            let actual = compute_event_hash(&ev)?;
            if *claimed != actual {
                return Ok(VerifyResult::Broken {
                    line,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {actual}"),
                });
            }
        }
        expected_prev = ev.hash_self;
    }

    Ok(VerifyResult::Valid { lines })
}
