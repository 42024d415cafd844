//! hbt-config
//!
//! Layered YAML configuration for the engine, daemon and CLI.
//!
//! - Documents are deep-merged in order; later layers override earlier ones.
//! - The merged tree is hashed over its canonical JSON, so two deployments can
//!   compare `config_hash` instead of files.
//! - Credentials never appear as literals. Sources name an env var, and a
//!   value that looks like a token aborts loading.
//! - Each binary declares which pointers it reads; anything else is reported
//!   (see [`report_unused_keys`]).

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

mod consumption;
mod secrets;
mod settings;

pub use consumption::{
    consumed_pointers_for_surface, report_unused_keys, ConfigSurface, UnusedKeyPolicy,
    UnusedKeyReport,
};
pub use secrets::{resolve_source_token, SourceToken};
pub use settings::{EngineSettings, SourceKind, SourceSpec, DEFAULT_DAEMON_ADDR};

/// Prefixes of well-known credential formats (API keys, cloud keys, PEM,
/// forge and chat tokens, JWTs).
const SECRET_PREFIXES: &[&str] = &[
    "sk-", "sk_live", "sk_test", "AKIA", "-----BEGIN", "ghp_", "gho_", "glpat-", "xoxb-",
    "xoxp-", "eyJ",
];

/// Shorter strings are never treated as secrets (`"sk-1"` could be a batch id).
const SECRET_MIN_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("read config layer {p}")))
        .collect::<Result<Vec<String>>>()?;
    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

/// Load the comma-separated layer list held in `HBT_CONFIG`. Blank entries
/// are skipped; no layers at all gives the empty config (all defaults).
pub fn load_from_path_list(list: &str) -> Result<LoadedConfig> {
    let paths: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    load_layered_yaml(&paths)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());
    for (layer, raw) in yaml_docs.iter().enumerate() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(raw)
            .with_context(|| format!("config layer {layer}: invalid yaml"))?;
        if yaml.is_null() {
            continue;
        }
        let json = serde_json::to_value(yaml)
            .with_context(|| format!("config layer {layer}: not representable as json"))?;
        overlay(&mut merged, json);
    }

    reject_secret_literals(&merged)?;

    let canonical_json =
        serde_json::to_string(&key_sorted(&merged)).context("serialize canonical config")?;
    Ok(LoadedConfig {
        config_hash: hex::encode(Sha256::digest(canonical_json.as_bytes())),
        canonical_json,
        config_json: merged,
    })
}

/// Objects merge key by key; anything else in `top` replaces `base`.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base_map), Value::Object(top_map)) => {
            for (k, v) in top_map {
                match base_map.get_mut(&k) {
                    Some(existing) => overlay(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, top) => *slot = top,
    }
}

/// Rebuild objects in key order, whatever map ordering serde_json was built with.
fn key_sorted(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), key_sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(key_sorted).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Leaf walk (shared by the secret guard and the unused-key report)
// ---------------------------------------------------------------------------

/// Every scalar in `v` with its JSON pointer. Empty objects and arrays have
/// no leaves.
pub(crate) fn leaves(v: &Value) -> Vec<(String, &Value)> {
    fn walk<'a>(v: &'a Value, at: String, out: &mut Vec<(String, &'a Value)>) {
        match v {
            Value::Object(map) => {
                for (k, child) in map {
                    let token = k.replace('~', "~0").replace('/', "~1");
                    walk(child, format!("{at}/{token}"), out);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    walk(child, format!("{at}/{i}"), out);
                }
            }
            scalar => {
                let pointer = if at.is_empty() { "/".to_string() } else { at };
                out.push((pointer, scalar));
            }
        }
    }
    let mut out = Vec::new();
    walk(v, String::new(), &mut out);
    out
}

fn reject_secret_literals(v: &Value) -> Result<()> {
    for (pointer, leaf) in leaves(v) {
        let Some(s) = leaf.as_str().map(str::trim) else {
            continue;
        };
        if s.len() >= SECRET_MIN_LEN && SECRET_PREFIXES.iter().any(|p| s.starts_with(p)) {
            bail!("CONFIG_SECRET_DETECTED leaf={pointer} value=REDACTED; store the env var name instead");
        }
    }
    Ok(())
}
