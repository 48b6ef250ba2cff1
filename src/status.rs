//! Per-unit processing status.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which stage a unit failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Load,
    Parse,
    Extraction,
    Timeout,
}

impl FailureKind {
    pub const ALL: [FailureKind; 4] = [
        FailureKind::Load,
        FailureKind::Parse,
        FailureKind::Extraction,
        FailureKind::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Load => "load",
            FailureKind::Parse => "parse",
            FailureKind::Extraction => "extraction",
            FailureKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown failure kind: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum UnitState {
    Pending,
    InProgress,
    Succeeded,
    Failed { kind: FailureKind, reason: String },
}

impl UnitState {
    pub fn failed(kind: FailureKind, reason: impl fmt::Display) -> Self {
        UnitState::Failed {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::InProgress => "in-progress",
            UnitState::Succeeded => "succeeded",
            UnitState::Failed { .. } => "failed",
        }
    }
}

/// Status of one unit as recorded in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub unit_id: String,
    pub offset: u64,
    /// Absent when the unit failed before its content was read.
    pub content_hash: Option<String>,
    #[serde(flatten)]
    pub state: UnitState,
}

impl UnitStatus {
    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match &self.state {
            UnitState::Failed { kind, reason } => Some((*kind, reason.as_str())),
            _ => None,
        }
    }
}
