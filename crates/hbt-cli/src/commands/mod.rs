//! Command handler modules for hbt-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod audit;
pub mod reconcile;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hbt_schemas::SourceRole;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a CLI `--role` string into a [`SourceRole`].
pub fn parse_role(role: &str) -> Result<SourceRole> {
    match SourceRole::parse(role) {
        Some(r) => Ok(r),
        None => anyhow::bail!(
            "invalid --role '{}'. expected one of: originator | processor | laboratory | regulator",
            role
        ),
    }
}

/// Parse a CLI `--now` RFC 3339 timestamp.
pub fn parse_now(now: Option<&str>) -> Result<DateTime<Utc>> {
    match now {
        None => Ok(Utc::now()),
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw.trim())
            .with_context(|| format!("invalid --now '{raw}': expected RFC 3339"))?
            .with_timezone(&Utc)),
    }
}

/// Read a text file, stripping a UTF-8 BOM if present.
pub fn read_text(path: &str) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("read failed: {path}"))?;
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(&bytes);
    String::from_utf8(bytes.to_vec()).with_context(|| format!("{path} must be UTF-8 text"))
}
