//! Status Arbiter
//!
//! Chooses the one authoritative lifecycle status from every status reported
//! for an identity.  The result is the maximum-rank status; the three terminal
//! values share a rank and are ordered Rejected > Approved > Completed.
//!
//! Because the arbiter is a pure function of the whole record set, a terminal
//! status is sticky by construction: a later record reporting a lower rank can
//! never lower the maximum.

use std::collections::BTreeSet;

use hbt_schemas::{BatchRecord, BatchStatus, ReportedStatus, SourceRole, TerminalConflict};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arbitration {
    pub status: BatchStatus,
    /// Role whose report decided `status` (freshest report, then latest role).
    pub status_source: Option<SourceRole>,
    pub terminal_conflict: Option<TerminalConflict>,
}

impl Arbitration {
    /// `true` when `record` reported something other than the winning status
    /// after the batch went terminal. Such records are stale for status and
    /// for decision fields.
    pub fn is_stale(&self, record: &BatchRecord) -> bool {
        self.status.is_terminal() && record.status != self.status
    }
}

fn status_key(s: BatchStatus) -> (u8, u8) {
    (s.rank(), s.terminal_precedence())
}

pub fn arbitrate(records: &[BatchRecord]) -> Arbitration {
    let Some(status) = records.iter().map(|r| r.status).max_by_key(|s| status_key(*s)) else {
        return Arbitration {
            status: BatchStatus::Pending,
            status_source: None,
            terminal_conflict: None,
        };
    };

    let status_source = records
        .iter()
        .filter(|r| r.status == status)
        .map(|r| (r.last_updated, r.source_role))
        .max()
        .map(|(_, role)| role);

    let terminal_conflict = if status.is_terminal() {
        let superseded: BTreeSet<ReportedStatus> = records
            .iter()
            .filter(|r| r.status.is_terminal() && r.status != status)
            .map(|r| ReportedStatus {
                source: r.source_role,
                status: r.status,
            })
            .collect();
        if superseded.is_empty() {
            None
        } else {
            Some(TerminalConflict {
                winner: status,
                winner_sources: records
                    .iter()
                    .filter(|r| r.status == status)
                    .map(|r| r.source_role)
                    .collect(),
                superseded: superseded.into_iter().collect(),
            })
        }
    } else {
        None
    };

    Arbitration {
        status,
        status_source,
        terminal_conflict,
    }
}
