use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::RunPhase;
use crate::aggregate::AggregateTable;
use crate::status::{FailureKind, UnitState, UnitStatus};
use crate::store::CheckpointToken;

/// Final status of a run.
///
/// Counts cover the units settled by this run; units already settled by the
/// checkpoint the run resumed from are counted as skipped.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub phase: RunPhase,
    /// Phases the run went through, in order.
    pub phases: Vec<RunPhase>,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
    /// Facts folded into the aggregate by this run.
    pub facts: u64,
    pub resumed_from: Option<CheckpointToken>,
    /// Last checkpoint written by this run.
    pub checkpoint: Option<CheckpointToken>,
    pub elapsed_ms: u64,
    /// Per-unit outcomes of this run, ordered by offset.
    pub outcomes: Vec<UnitStatus>,
    /// Aggregate table as of the final checkpoint (including resumed state).
    #[serde(skip)]
    pub table: AggregateTable,
}

/// Failed unit, for re-triage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit<'a> {
    pub unit_id: &'a str,
    pub kind: FailureKind,
    pub reason: &'a str,
}

impl RunReport {
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn failed_units(&self) -> Vec<FailedUnit<'_>> {
        self.outcomes
            .iter()
            .filter_map(|status| match &status.state {
                UnitState::Failed { kind, reason } => Some(FailedUnit {
                    unit_id: &status.unit_id,
                    kind: *kind,
                    reason,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn status_of(&self, unit_id: &str) -> Option<&UnitState> {
        self.outcomes
            .iter()
            .find(|s| s.unit_id == unit_id)
            .map(|s| &s.state)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} in {:.1}s", self.phase, self.elapsed_ms as f64 / 1000.0)?;
        writeln!(f, "  succeeded: {}", self.succeeded)?;
        writeln!(f, "  failed:    {}", self.failed)?;
        for (kind, count) in &self.failures_by_kind {
            writeln!(f, "    {kind}: {count}")?;
        }
        writeln!(f, "  skipped:   {}", self.skipped)?;
        writeln!(f, "  facts:     {}", self.facts)?;
        if let Some(token) = self.resumed_from {
            writeln!(f, "  resumed from checkpoint {token}")?;
        }
        match self.checkpoint {
            Some(token) => write!(f, "  checkpoint: {token}"),
            None => write!(f, "  checkpoint: none"),
        }
    }
}
