//! Fixtures and helpers shared by the cross-crate scenario tests.

use anyhow::{bail, Context, Result};
use std::fs;

use hbt_reconcile::normalize_json;
use hbt_schemas::{BatchRecord, SourceRole};

mod convergence;
mod fixtures;
mod harness;

pub use convergence::{convergence_view, permutations, ConvergenceView, StepView};
pub use fixtures::{
    bridging_records, lifecycle_records, scenario_a_records, scenario_b_records,
    scenario_b_stale_resync, scenario_c_record, t,
};
pub use harness::EngineHarness;

/// Load a fixture file of raw records. Any malformed record fails the load:
/// fixtures are expected to be clean.
pub fn load_records_json(path: &str, role_hint: Option<SourceRole>) -> Result<Vec<BatchRecord>> {
    let s = fs::read_to_string(path).with_context(|| format!("read fixture: {path}"))?;
    let (records, errors) =
        normalize_json(&s, role_hint).with_context(|| format!("parse fixture json: {path}"))?;
    if let Some(first) = errors.first() {
        bail!("fixture {path} has {} malformed record(s); first: {first}", errors.len());
    }
    Ok(records)
}
