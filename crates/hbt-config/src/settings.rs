//! Typed engine settings read from the merged config JSON.
//!
//! Every setting has a default, so the empty config is a valid config.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use hbt_schemas::SourceRole;

pub const DEFAULT_DAEMON_ADDR: &str = "127.0.0.1:8890";

const DEFAULT_FUZZY_MIN_LEN: usize = 4;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
const DEFAULT_RESYNC_INTERVAL_MS: u64 = 30_000;
const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    JsonFile { path: String },
    Http {
        url: String,
        /// Name of the env var holding a bearer token. Never the token itself.
        token_env: Option<String>,
    },
}

/// One resync source: which participant it speaks for and where to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub role: SourceRole,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub fuzzy_min_len: usize,
    pub subscriber_buffer: usize,
    pub resync_interval_ms: u64,
    pub source_timeout_ms: u64,
    pub audit_path: Option<String>,
    pub audit_hash_chain: bool,
    pub daemon_addr: String,
    pub sources: Vec<SourceSpec>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fuzzy_min_len: DEFAULT_FUZZY_MIN_LEN,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            resync_interval_ms: DEFAULT_RESYNC_INTERVAL_MS,
            source_timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            audit_path: None,
            audit_hash_chain: true,
            daemon_addr: DEFAULT_DAEMON_ADDR.to_string(),
            sources: Vec::new(),
        }
    }
}

fn read_u64(config: &Value, pointer: &str, default: u64) -> Result<u64> {
    match config.pointer(pointer) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .with_context(|| format!("CONFIG_INVALID {pointer}: expected non-negative integer")),
    }
}

fn read_str(config: &Value, pointer: &str) -> Option<String> {
    let s = config.pointer(pointer)?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn parse_source(index: usize, v: &Value) -> Result<SourceSpec> {
    let at = |k: &str| format!("/{k}");
    let role_raw = read_str(v, &at("role"))
        .with_context(|| format!("CONFIG_INVALID /sources/{index}/role: missing"))?;
    let Some(role) = SourceRole::parse(&role_raw) else {
        bail!("CONFIG_INVALID /sources/{index}/role: unknown role '{role_raw}'");
    };
    let kind = match read_str(v, &at("kind")).as_deref() {
        Some("json_file") => SourceKind::JsonFile {
            path: read_str(v, &at("path"))
                .with_context(|| format!("CONFIG_INVALID /sources/{index}/path: missing"))?,
        },
        Some("http") => SourceKind::Http {
            url: read_str(v, &at("url"))
                .with_context(|| format!("CONFIG_INVALID /sources/{index}/url: missing"))?,
            token_env: read_str(v, &at("token_env")),
        },
        Some(other) => {
            bail!("CONFIG_INVALID /sources/{index}/kind: unknown kind '{other}'")
        }
        None => bail!("CONFIG_INVALID /sources/{index}/kind: missing"),
    };
    Ok(SourceSpec { role, kind })
}

impl EngineSettings {
    pub fn from_config_json(config: &Value) -> Result<Self> {
        let d = Self::default();

        let fuzzy_min_len = read_u64(config, "/identity/fuzzy_min_len", d.fuzzy_min_len as u64)?;
        let subscriber_buffer =
            read_u64(config, "/notifier/subscriber_buffer", d.subscriber_buffer as u64)?;
        if subscriber_buffer == 0 {
            bail!("CONFIG_INVALID /notifier/subscriber_buffer: must be at least 1");
        }

        let audit_hash_chain = match config.pointer("/audit/hash_chain") {
            None | Some(Value::Null) => d.audit_hash_chain,
            Some(v) => v
                .as_bool()
                .context("CONFIG_INVALID /audit/hash_chain: expected boolean")?,
        };

        let sources = match config.pointer("/sources") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, v)| parse_source(i, v))
                .collect::<Result<Vec<_>>>()?,
            Some(_) => bail!("CONFIG_INVALID /sources: expected a list"),
        };

        Ok(Self {
            fuzzy_min_len: fuzzy_min_len as usize,
            subscriber_buffer: subscriber_buffer as usize,
            resync_interval_ms: read_u64(config, "/resync/interval_ms", d.resync_interval_ms)?,
            source_timeout_ms: read_u64(config, "/resync/source_timeout_ms", d.source_timeout_ms)?,
            audit_path: read_str(config, "/audit/path"),
            audit_hash_chain,
            daemon_addr: read_str(config, "/daemon/addr").unwrap_or(d.daemon_addr),
            sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_config_is_all_defaults() {
        let s = EngineSettings::from_config_json(&json!({})).unwrap();
        assert_eq!(s, EngineSettings::default());
        assert_eq!(s.daemon_addr, "127.0.0.1:8890");
        assert_eq!(s.fuzzy_min_len, 4);
    }

    #[test]
    fn sources_parse_with_role_synonyms() {
        let cfg = json!({
            "sources": [
                {"role": "farmer", "kind": "json_file", "path": "data/collections.json"},
                {"role": "lab", "kind": "http", "url": "http://lab.local/records", "token_env": "LAB_TOKEN"}
            ]
        });
        let s = EngineSettings::from_config_json(&cfg).unwrap();
        assert_eq!(s.sources.len(), 2);
        assert_eq!(s.sources[0].role, SourceRole::Originator);
        assert_eq!(
            s.sources[1].kind,
            SourceKind::Http {
                url: "http://lab.local/records".into(),
                token_env: Some("LAB_TOKEN".into())
            }
        );
    }

    #[test]
    fn invalid_values_are_rejected_with_pointer() {
        let err = EngineSettings::from_config_json(&json!({"resync": {"interval_ms": "soon"}}))
            .unwrap_err();
        assert!(err.to_string().contains("/resync/interval_ms"));

        let bad_role = json!({"sources": [{"role": "auditor", "kind": "http"}]});
        let err = EngineSettings::from_config_json(&bad_role).unwrap_err();
        assert!(err.to_string().contains("unknown role"));

        let err = EngineSettings::from_config_json(&json!({"notifier": {"subscriber_buffer": 0}}))
            .unwrap_err();
        assert!(err.to_string().contains("subscriber_buffer"));
    }
}
