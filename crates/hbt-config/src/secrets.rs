//! Source credentials.
//!
//! # Contract
//! - Config YAML stores only env var NAMES (`/sources/<n>/token_env`).
//! - Tokens are resolved once, when the source is built; nothing else reads
//!   `std::env` for credentials.
//! - `Debug` on [`SourceToken`] redacts the value.
//! - Errors name the env var, never the value.

use anyhow::{bail, Result};

use crate::settings::{SourceKind, SourceSpec};

/// A resolved bearer token. Redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceToken(String);

impl SourceToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SourceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SourceToken(<REDACTED>)")
    }
}

/// Unset or blank counts as missing.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve the token for `spec`.
///
/// `Ok(None)` when the source needs no token. A configured `token_env` that
/// is unset is an error naming the variable.
pub fn resolve_source_token(spec: &SourceSpec) -> Result<Option<SourceToken>> {
    let SourceKind::Http {
        token_env: Some(var),
        ..
    } = &spec.kind
    else {
        return Ok(None);
    };
    match resolve_env(var) {
        Some(v) => Ok(Some(SourceToken(v))),
        None => bail!(
            "SECRETS_MISSING source={}: required env var '{}' is not set or empty",
            spec.role,
            var
        ),
    }
}
