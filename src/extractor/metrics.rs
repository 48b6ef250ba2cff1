use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Measurements the extractor knows how to take. Which ones are emitted is
/// configuration; see [`super::ExtractOptions::metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    /// Per scope: 1 + decision points.
    Cyclomatic,
    /// Per scope: deepest nesting of control blocks.
    NestingDepth,
    /// Per unit: call expressions.
    Calls,
    /// Per unit: assignment statements and declarators.
    Assignments,
    /// Per unit: attribute / member accesses.
    Attributes,
    /// Per unit: characters of cleaned source.
    Size,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Cyclomatic,
        Metric::NestingDepth,
        Metric::Calls,
        Metric::Assignments,
        Metric::Attributes,
        Metric::Size,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cyclomatic => "cyclomatic",
            Metric::NestingDepth => "nesting-depth",
            Metric::Calls => "calls",
            Metric::Assignments => "assignments",
            Metric::Attributes => "attributes",
            Metric::Size => "size",
        }
    }

    pub fn is_per_scope(&self) -> bool {
        matches!(self, Metric::Cyclomatic | Metric::NestingDepth)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric: {s}"))
    }
}

/// Running counters for one function/method (or the module itself).
#[derive(Debug, Clone)]
pub(crate) struct ScopeFrame {
    pub name: String,
    pub line: usize,
    pub branches: u64,
    pub depth: u32,
    pub max_depth: u32,
}

impl ScopeFrame {
    pub fn new(name: String, line: usize) -> Self {
        Self {
            name,
            line,
            branches: 0,
            depth: 0,
            max_depth: 0,
        }
    }

    pub fn enter_block(&mut self) {
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
    }

    pub fn leave_block(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Cyclomatic => Some((1 + self.branches) as f64),
            Metric::NestingDepth => Some(f64::from(self.max_depth)),
            _ => None,
        }
    }
}

/// Whole-unit tallies, reported once after the walk.
#[derive(Debug, Clone, Default)]
pub(crate) struct UnitCounters {
    pub calls: u64,
    pub assignments: u64,
    pub attributes: u64,
}

impl UnitCounters {
    pub fn value(&self, metric: Metric, source_chars: usize) -> Option<f64> {
        match metric {
            Metric::Calls => Some(self.calls as f64),
            Metric::Assignments => Some(self.assignments as f64),
            Metric::Attributes => Some(self.attributes as f64),
            Metric::Size => Some(source_chars as f64),
            _ => None,
        }
    }
}
