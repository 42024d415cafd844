//! `hbt reconcile`: the pure pipeline over a file of records, no engine.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::warn;

use hbt_config::{
    load_layered_yaml, report_unused_keys, ConfigSurface, EngineSettings, UnusedKeyPolicy,
};
use hbt_reconcile::{normalize_json, reconcile_offline, DEFAULT_FUZZY_MIN_LEN};

use super::{parse_now, parse_role, read_text};

pub struct ReconcileArgs {
    pub input: String,
    pub role: Option<String>,
    pub config_paths: Vec<String>,
    pub now: Option<String>,
    pub strict_config: bool,
}

fn fuzzy_min_len(config_paths: &[String], strict: bool) -> Result<usize> {
    if config_paths.is_empty() {
        return Ok(DEFAULT_FUZZY_MIN_LEN);
    }
    let refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
    let loaded = load_layered_yaml(&refs)?;
    let policy = if strict {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let report = report_unused_keys(ConfigSurface::Offline, &loaded.config_json, policy)?;
    for pointer in &report.unused_leaf_pointers {
        warn!(pointer = %pointer, "config key ignored by offline reconcile");
    }
    Ok(EngineSettings::from_config_json(&loaded.config_json)?.fuzzy_min_len)
}

/// Run the offline reconciliation and build the JSON document to print.
pub fn run(args: ReconcileArgs) -> Result<Value> {
    let role_hint = args.role.as_deref().map(parse_role).transpose()?;
    let now = parse_now(args.now.as_deref())?;
    let fuzzy_min_len = fuzzy_min_len(&args.config_paths, args.strict_config)?;

    let raw = read_text(&args.input)?;
    let (records, errors) = normalize_json(&raw, role_hint)
        .with_context(|| format!("{} is not valid JSON", args.input))?;
    for e in &errors {
        warn!(error = %e, "malformed record dropped");
    }

    let report = reconcile_offline(records, fuzzy_min_len, now);
    for (survivor, absorbed) in &report.ambiguous {
        warn!(identity = %survivor, absorbed = absorbed.len(), "ambiguous identity; merged");
    }

    let mut messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    if report.dropped > 0 {
        messages.push(format!("{} record(s) without a usable external id", report.dropped));
    }

    Ok(json!({
        "batches": report
            .batches
            .iter()
            .map(|r| json!({ "batch": r.batch, "timeline": r.timeline }))
            .collect::<Vec<_>>(),
        "dropped": errors.len() + report.dropped,
        "errors": messages,
        "ambiguous": report
            .ambiguous
            .iter()
            .map(|(survivor, absorbed)| json!({ "survivor": survivor, "absorbed": absorbed }))
            .collect::<Vec<_>>(),
    }))
}
