//! Run orchestration: load → parse → extract → aggregate → checkpoint, with
//! bounded parallelism and per-unit failure isolation.
mod ledger;
pub mod orchestrator;
pub mod report;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::extractor::ExtractionError;
use crate::loader::LoadError;
use crate::parser::ParseFailure;
use crate::status::FailureKind;
use crate::store::{CheckpointError, ResumeFrom};

pub use orchestrator::Orchestrator;
pub use report::RunReport;

// ── Errors ───────────────────────────────────────────────────────────

/// Why one unit failed. Recorded against the unit; never aborts the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitFailure {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Parse(#[from] ParseFailure),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("timed out after {limit_ms} ms")]
    Timeout { limit_ms: u64 },
}

impl UnitFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            UnitFailure::Load(_) => FailureKind::Load,
            UnitFailure::Parse(_) => FailureKind::Parse,
            UnitFailure::Extraction(_) => FailureKind::Extraction,
            UnitFailure::Timeout { .. } => FailureKind::Timeout,
        }
    }
}

/// Errors that end a run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("checkpoint failed after {attempts} attempts: {source}")]
    Checkpoint {
        attempts: u32,
        #[source]
        source: CheckpointError,
    },

    #[error("cannot resume: {0}")]
    Resume(#[source] CheckpointError),

    #[error("cannot enumerate corpus: {0}")]
    Load(#[from] LoadError),

    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: RunPhase, to: RunPhase },

    #[error("background task failed: {0}")]
    Task(String),
}

// ── Phases ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Initializing,
    Scanning,
    Checkpointing,
    Draining,
    Completed,
    Aborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Initializing => "initializing",
            RunPhase::Scanning => "scanning",
            RunPhase::Checkpointing => "checkpointing",
            RunPhase::Draining => "draining",
            RunPhase::Completed => "completed",
            RunPhase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforces the run state machine:
///
/// ```text
/// initializing → scanning ⇄ checkpointing
///                scanning → draining ⇄ checkpointing
///                           draining → completed | aborted
/// initializing → aborted
/// ```
///
/// Checkpointing returns to whichever phase it was entered from.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: RunPhase,
    return_to: Option<RunPhase>,
    history: Vec<RunPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Initializing,
            return_to: None,
            history: vec![RunPhase::Initializing],
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    pub fn transition(&mut self, to: RunPhase) -> Result<(), PipelineError> {
        use RunPhase::*;
        let from = self.phase;
        let allowed = match (from, to) {
            (Initializing, Scanning | Aborted) => true,
            (Scanning, Checkpointing | Draining) => true,
            (Checkpointing, next) => self.return_to == Some(next),
            (Draining, Checkpointing | Completed | Aborted) => true,
            _ => false,
        };
        if !allowed {
            return Err(PipelineError::InvalidTransition { from, to });
        }
        self.return_to = (to == Checkpointing).then_some(from);
        self.phase = to;
        self.history.push(to);
        info!("run phase: {from} -> {to}");
        Ok(())
    }
}

// ── Options ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Units processed concurrently.
    pub parallelism: usize,
    /// Wall-clock limit for load + parse + extract of one unit.
    pub unit_timeout: Duration,
    /// Checkpoint after this many settled units (0 disables).
    pub checkpoint_every_units: u64,
    /// Checkpoint after this much time (None disables).
    pub checkpoint_every: Option<Duration>,
    /// Retries of a failed checkpoint save before the run aborts.
    pub max_retries: u32,
    /// First retry delay; doubles on each retry.
    pub retry_backoff: Duration,
    pub resume: Option<ResumeFrom>,
    /// On resume, process again the units that failed before.
    pub retry_failed: bool,
    /// Stop dispatching after this many units.
    pub max_units: Option<u64>,
    pub aggregate_shards: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map_or(4, |n| n.get()),
            unit_timeout: Duration::from_secs(30),
            checkpoint_every_units: 500,
            checkpoint_every: Some(Duration::from_secs(60)),
            max_retries: 5,
            retry_backoff: Duration::from_millis(200),
            resume: None,
            retry_failed: false,
            max_units: None,
            aggregate_shards: 64,
        }
    }
}
