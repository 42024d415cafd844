//! Unused-key guard.
//!
//! Each binary registers the JSON-pointer prefixes it actually reads. A
//! config leaf outside every registered prefix is a key someone expects to
//! have an effect and does not: the daemon warns, the CLI warns or fails
//! (`--strict-config`).
//!
//! A prefix covers itself and everything below it: `/sources` covers
//! `/sources/0/url`, while `/resync/interval` would not cover
//! `/resync/interval_ms`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::leaves;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSurface {
    Daemon,
    Offline,
}

impl ConfigSurface {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSurface::Daemon => "DAEMON",
            ConfigSurface::Offline => "OFFLINE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub surface: String,
    pub consumed_prefixes: Vec<String>,
    /// Sorted, unique.
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Pointers each surface reads. Keep in step with `EngineSettings` and the
/// `hbt reconcile` command.
pub fn consumed_pointers_for_surface(surface: ConfigSurface) -> &'static [&'static str] {
    match surface {
        ConfigSurface::Daemon => &[
            "/identity/fuzzy_min_len",
            "/notifier/subscriber_buffer",
            "/resync/interval_ms",
            "/resync/source_timeout_ms",
            "/audit/path",
            "/audit/hash_chain",
            "/daemon/addr",
            "/sources",
        ],
        ConfigSurface::Offline => &["/identity/fuzzy_min_len"],
    }
}

fn covers(prefix: &str, pointer: &str) -> bool {
    prefix == "/"
        || pointer == prefix
        || pointer
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Unused leaves of `config_json` for `surface`. `Fail` turns a non-empty
/// report into `CONFIG_UNUSED_KEYS`.
pub fn report_unused_keys(
    surface: ConfigSurface,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed = consumed_pointers_for_surface(surface);

    let mut unused: Vec<String> = leaves(config_json)
        .into_iter()
        .map(|(pointer, _)| pointer)
        .filter(|pointer| !consumed.iter().any(|prefix| covers(prefix, pointer)))
        .collect();
    unused.sort();
    unused.dedup();

    let mut consumed_prefixes: Vec<String> = consumed.iter().map(|p| p.to_string()).collect();
    consumed_prefixes.sort();

    let report = UnusedKeyReport {
        surface: surface.as_str().to_string(),
        consumed_prefixes,
        unused_leaf_pointers: unused,
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let shown: Vec<&str> = report
            .unused_leaf_pointers
            .iter()
            .take(12)
            .map(String::as_str)
            .collect();
        bail!(
            "CONFIG_UNUSED_KEYS (surface={}): {} key(s) have no effect: {}",
            report.surface,
            report.unused_leaf_pointers.len(),
            shown.join(", ")
        );
    }
    Ok(report)
}
