//! Fact extraction: structural tree → normalized usage records.
//!
//! [`FactExtractor::extract`] returns a lazy iterator. Facts come out in a
//! fixed order for a given tree: the pre-order walk (imports, calls and
//! per-scope metrics as each scope closes), then unit-level metrics, then
//! detector hits in registry order.
pub mod bindings;
pub mod detectors;
pub mod metrics;
pub mod stdlib;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tree_sitter::Node;

use crate::loader::SourceUnit;
use crate::parser::{is_error_node, StructuralTree, SyntaxProfile};
use bindings::{Bindings, Callee, ScopeId, MODULE_SCOPE_ID};
use metrics::{ScopeFrame, UnitCounters};

pub use detectors::{DetectorRegistry, PatternDetector, PatternHit, QueryDetector};
pub use metrics::Metric;

/// Scope name used for top-level code.
pub const MODULE_SCOPE: &str = "<module>";
const ANONYMOUS_SCOPE: &str = "<anonymous>";
/// Walk steps between deadline checks.
const DEADLINE_CHECK_STEPS: u32 = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionError {
    #[error("detector {detector} has an invalid query: {detail}")]
    InvalidQuery { detector: String, detail: String },

    #[error("unit produced more than {limit} facts")]
    TooManyFacts { limit: usize },

    #[error("unknown pattern detector: {0}")]
    UnknownDetector(String),

    #[error("extraction panicked: {0}")]
    Panicked(String),

    #[error("extraction ran past its deadline")]
    DeadlineExceeded,
}

// ── Facts ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FactKind {
    Call,
    UnresolvedCall,
    Import,
    ImportMember,
    /// Import of a standard-library module
    StdlibImport,
    StdlibMember,
    Metric,
    Pattern(String),
}

impl FactKind {
    pub fn pattern(name: &str) -> Self {
        FactKind::Pattern(name.to_string())
    }
}

impl fmt::Display for FactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactKind::Call => f.write_str("call"),
            FactKind::UnresolvedCall => f.write_str("unresolved-call"),
            FactKind::Import => f.write_str("import"),
            FactKind::ImportMember => f.write_str("import-member"),
            FactKind::StdlibImport => f.write_str("stdlib-import"),
            FactKind::StdlibMember => f.write_str("stdlib-member"),
            FactKind::Metric => f.write_str("metric"),
            FactKind::Pattern(name) => write!(f, "pattern:{name}"),
        }
    }
}

impl FromStr for FactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(FactKind::Call),
            "unresolved-call" => Ok(FactKind::UnresolvedCall),
            "import" => Ok(FactKind::Import),
            "import-member" => Ok(FactKind::ImportMember),
            "stdlib-import" => Ok(FactKind::StdlibImport),
            "stdlib-member" => Ok(FactKind::StdlibMember),
            "metric" => Ok(FactKind::Metric),
            other => match other.strip_prefix("pattern:") {
                Some(name) if !name.is_empty() => Ok(FactKind::Pattern(name.to_string())),
                _ => Err(format!("unknown fact kind: {other}")),
            },
        }
    }
}

impl Serialize for FactKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FactKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One observation from one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub kind: FactKind,
    pub identifier: String,
    pub unit: Arc<str>,
    pub value: Option<f64>,
    pub scope: Option<String>,
    /// 1-based
    pub line: usize,
}

// ── Options ──────────────────────────────────────────────────────────

fn default_metrics() -> Vec<Metric> {
    Metric::ALL.to_vec()
}

fn default_max_facts() -> usize {
    100_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Metrics to emit.
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,

    /// Detectors to run; all registered detectors when unset.
    #[serde(default)]
    pub detectors: Option<Vec<String>>,

    #[serde(default = "default_max_facts")]
    pub max_facts_per_unit: usize,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
            detectors: None,
            max_facts_per_unit: default_max_facts(),
        }
    }
}

// ── Extractor ────────────────────────────────────────────────────────

pub struct FactExtractor {
    options: ExtractOptions,
    detectors: DetectorRegistry,
}

impl FactExtractor {
    /// Build an extractor running the detectors selected by `options` out of
    /// `registry`.
    pub fn new(options: ExtractOptions, registry: DetectorRegistry) -> Result<Self, ExtractionError> {
        let detectors = match &options.detectors {
            Some(names) => registry.select(names)?,
            None => registry,
        };
        Ok(Self { options, detectors })
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    pub fn detectors(&self) -> &DetectorRegistry {
        &self.detectors
    }

    /// Lazily extract the facts of `tree`. Calling this again on the same
    /// tree yields the same facts in the same order.
    pub fn extract<'a>(&'a self, tree: &'a StructuralTree, unit: &SourceUnit) -> Facts<'a> {
        Facts::new(self, tree, Arc::from(unit.id()))
    }

    /// Like [`extract`](Self::extract), but the iterator stops with
    /// [`ExtractionError::DeadlineExceeded`] once `deadline` has passed.
    pub fn extract_until<'a>(
        &'a self,
        tree: &'a StructuralTree,
        unit: &SourceUnit,
        deadline: Instant,
    ) -> Facts<'a> {
        let mut facts = Facts::new(self, tree, Arc::from(unit.id()));
        facts.deadline = Some(deadline);
        facts
    }
}

enum Step<'t> {
    /// A node and the binding scope it sits in.
    Visit(Node<'t>, ScopeId),
    LeaveScope,
    LeaveClass,
    LeaveBlock,
}

enum Stage {
    Walk,
    Detect,
    Done,
}

/// Iterator over the facts of one tree. Yields at most one error, after
/// which it is exhausted.
pub struct Facts<'a> {
    extractor: &'a FactExtractor,
    tree: &'a StructuralTree,
    profile: &'static SyntaxProfile,
    unit: Arc<str>,
    bindings: Bindings,
    stack: Vec<Step<'a>>,
    qualifiers: Vec<String>,
    scopes: Vec<ScopeFrame>,
    counters: UnitCounters,
    pending: VecDeque<FactRecord>,
    emitted: usize,
    stage: Stage,
    deadline: Option<Instant>,
    steps: u32,
}

impl<'a> Facts<'a> {
    fn new(extractor: &'a FactExtractor, tree: &'a StructuralTree, unit: Arc<str>) -> Self {
        let empty = tree.is_empty();
        Self {
            extractor,
            tree,
            profile: tree.language().config().profile,
            unit,
            bindings: Bindings::collect(tree),
            stack: if empty {
                Vec::new()
            } else {
                vec![Step::Visit(tree.root(), MODULE_SCOPE_ID)]
            },
            qualifiers: Vec::new(),
            scopes: vec![ScopeFrame::new(MODULE_SCOPE.to_string(), 1)],
            counters: UnitCounters::default(),
            pending: VecDeque::new(),
            emitted: 0,
            stage: if empty { Stage::Done } else { Stage::Walk },
            deadline: None,
            steps: 0,
        }
    }

    fn fact(&self, kind: FactKind, identifier: String, line: usize) -> FactRecord {
        FactRecord {
            kind,
            identifier,
            unit: self.unit.clone(),
            value: None,
            scope: None,
            line,
        }
    }

    fn wants(&self, metric: Metric) -> bool {
        self.extractor.options.metrics.contains(&metric)
    }

    fn step(&mut self, step: Step<'a>) {
        match step {
            Step::Visit(node, scope) => self.visit(node, scope),
            Step::LeaveScope => {
                self.qualifiers.pop();
                if let Some(frame) = self.scopes.pop() {
                    self.emit_scope_metrics(&frame);
                }
            }
            Step::LeaveClass => {
                self.qualifiers.pop();
            }
            Step::LeaveBlock => {
                if let Some(frame) = self.scopes.last_mut() {
                    frame.leave_block();
                }
            }
        }
    }

    fn visit(&mut self, node: Node<'a>, scope: ScopeId) {
        if is_error_node(node) {
            return;
        }
        let kind = node.kind();
        let line = node.start_position().row + 1;
        let profile = self.profile;
        let language = self.tree.language();

        for import in bindings::imports_of(self.tree, node) {
            let stdlib = stdlib::is_stdlib_module(language, &import.module);
            if stdlib {
                self.pending
                    .push_back(self.fact(FactKind::StdlibImport, import.module.clone(), line));
            }
            self.pending
                .push_back(self.fact(FactKind::Import, import.module, line));
            if let Some(member) = import.member {
                if stdlib {
                    self.pending
                        .push_back(self.fact(FactKind::StdlibMember, member.clone(), line));
                }
                self.pending
                    .push_back(self.fact(FactKind::ImportMember, member, line));
            }
        }

        if kind == profile.call_kind {
            self.counters.calls += 1;
            self.visit_call(node, scope, line);
        } else if kind == profile.attribute_kind {
            self.counters.attributes += 1;
        } else if profile.assignment_kinds.contains(&kind) {
            self.counters.assignments += 1;
        }

        if self.is_branch(node) {
            if let Some(frame) = self.scopes.last_mut() {
                frame.branches += 1;
            }
        }

        // Exit markers go on the stack below the children.
        if profile.scope_kinds.contains(&kind) {
            let name = self.scope_name(node);
            self.qualifiers.push(name.clone());
            self.scopes.push(ScopeFrame::new(self.qualifiers.join("."), line));
            self.stack.push(Step::LeaveScope);
        } else if profile.class_kinds.contains(&kind) {
            let name = node
                .child_by_field_name("name")
                .map(|n| self.tree.text(n).to_string())
                .unwrap_or_else(|| ANONYMOUS_SCOPE.to_string());
            self.qualifiers.push(name);
            self.stack.push(Step::LeaveClass);
        } else if profile.nesting_kinds.contains(&kind) {
            if let Some(frame) = self.scopes.last_mut() {
                frame.enter_block();
            }
            self.stack.push(Step::LeaveBlock);
        }

        let inner = self.bindings.scope_opened_by(node).unwrap_or(scope);
        let mut cursor = node.walk();
        let children: Vec<Node<'a>> = node.children(&mut cursor).collect();
        self.stack
            .extend(children.into_iter().rev().map(|child| Step::Visit(child, inner)));
    }

    fn visit_call(&mut self, node: Node<'a>, scope: ScopeId, line: usize) {
        // `require('m')` is reported as an import
        if bindings::require_module(self.tree, node).is_some() {
            return;
        }
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        if is_error_node(function) {
            return;
        }
        let fact = match self.bindings.resolve(self.tree, function, scope) {
            Callee::Resolved(target) => self.fact(FactKind::Call, target, line),
            Callee::Unresolved(text) => self.fact(FactKind::UnresolvedCall, text, line),
        };
        self.pending.push_back(fact);
    }

    fn is_branch(&self, node: Node<'_>) -> bool {
        let kind = node.kind();
        if self.profile.branch_kinds.contains(&kind) {
            return true;
        }
        match self.profile.logical_kind {
            Some(logical) if logical == kind => node
                .child_by_field_name("operator")
                .is_some_and(|op| self.profile.logical_operators.contains(&op.kind())),
            _ => false,
        }
    }

    /// Name of a function-like node: its own name, or the variable it is
    /// assigned to (`const f = () => …`).
    fn scope_name(&self, node: Node<'_>) -> String {
        if let Some(name) = node.child_by_field_name("name") {
            return self.tree.text(name).to_string();
        }
        node.parent()
            .filter(|p| p.kind() == "variable_declarator")
            .and_then(|p| p.child_by_field_name("name"))
            .map(|n| self.tree.text(n).to_string())
            .unwrap_or_else(|| ANONYMOUS_SCOPE.to_string())
    }

    fn emit_scope_metrics(&mut self, frame: &ScopeFrame) {
        for metric in Metric::ALL.into_iter().filter(|m| m.is_per_scope()) {
            if !self.wants(metric) {
                continue;
            }
            let mut fact = self.fact(FactKind::Metric, metric.to_string(), frame.line);
            fact.value = frame.value(metric);
            fact.scope = Some(frame.name.clone());
            self.pending.push_back(fact);
        }
    }

    /// Close the module scope and report unit-level metrics.
    fn finish_walk(&mut self) {
        while let Some(frame) = self.scopes.pop() {
            self.emit_scope_metrics(&frame);
        }
        let chars = self.tree.source().chars().count();
        for metric in Metric::ALL.into_iter().filter(|m| !m.is_per_scope()) {
            if !self.wants(metric) {
                continue;
            }
            let mut fact = self.fact(FactKind::Metric, metric.to_string(), 1);
            fact.value = self.counters.value(metric, chars);
            self.pending.push_back(fact);
        }
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn run_detectors(&mut self) -> Result<(), ExtractionError> {
        let language = self.tree.language();
        for detector in self.extractor.detectors.iter() {
            if !detector.supports(language) {
                continue;
            }
            if self.past_deadline() {
                return Err(ExtractionError::DeadlineExceeded);
            }
            let kind = FactKind::pattern(detector.name());
            for hit in detector.detect(self.tree)? {
                self.pending
                    .push_back(self.fact(kind.clone(), hit.identifier, hit.line));
            }
        }
        Ok(())
    }
}

impl Iterator for Facts<'_> {
    type Item = Result<FactRecord, ExtractionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fact) = self.pending.pop_front() {
                self.emitted += 1;
                let limit = self.extractor.options.max_facts_per_unit;
                if self.emitted > limit {
                    self.stage = Stage::Done;
                    self.pending.clear();
                    self.stack.clear();
                    return Some(Err(ExtractionError::TooManyFacts { limit }));
                }
                return Some(Ok(fact));
            }

            match self.stage {
                Stage::Walk => match self.stack.pop() {
                    Some(step) => {
                        self.steps = self.steps.wrapping_add(1);
                        if self.steps % DEADLINE_CHECK_STEPS == 0 && self.past_deadline() {
                            self.stage = Stage::Done;
                            self.stack.clear();
                            return Some(Err(ExtractionError::DeadlineExceeded));
                        }
                        self.step(step);
                    }
                    None => {
                        self.finish_walk();
                        self.stage = Stage::Detect;
                    }
                },
                Stage::Detect => {
                    self.stage = Stage::Done;
                    if let Err(e) = self.run_detectors() {
                        self.pending.clear();
                        return Some(Err(e));
                    }
                }
                Stage::Done => return None,
            }
        }
    }
}
