//! Pattern detectors.
//!
//! Each detector inspects a whole tree and reports hits; the extractor turns
//! a hit into a `pattern:<detector name>` fact. Adding a detector means
//! implementing [`PatternDetector`] (or writing a [`QueryDetector`]) and
//! registering it, nothing else changes.
//!
//! The built-in detectors are tree-sitter queries, one per language family.
//! A query marks the reported node with `@hit`. The fact identifier is the
//! text of an `@id` capture when there is one, else the pattern's
//! `(#set! identifier "...")` property, else the text of `@hit`.
use std::collections::HashMap;
use std::sync::Arc;
use tree_sitter::{Query, QueryCursor, QueryMatch, StreamingIterator};

use super::ExtractionError;
use crate::parser::{is_error_node, Language, LanguageConfig, StructuralTree};

/// One occurrence reported by a detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub identifier: String,
    /// 1-based
    pub line: usize,
}

pub trait PatternDetector: Send + Sync {
    /// Stable name; facts are emitted as `pattern:<name>`.
    fn name(&self) -> &'static str;

    fn supports(&self, language: Language) -> bool;

    fn detect(&self, tree: &StructuralTree) -> Result<Vec<PatternHit>, ExtractionError>;
}

/// Ordered set of detectors. Detectors run in registration order.
#[derive(Clone, Default)]
pub struct DetectorRegistry {
    detectors: Vec<Arc<dyn PatternDetector>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in detector.
    pub fn builtin() -> Result<Self, ExtractionError> {
        let mut registry = Self::new();
        for (name, python, ecmascript) in BUILTIN_QUERIES {
            registry.register(QueryDetector::new(name, python, ecmascript)?);
        }
        Ok(registry)
    }

    /// Add a detector. A detector with the same name replaces the old one.
    pub fn register(&mut self, detector: impl PatternDetector + 'static) {
        let name = detector.name();
        self.detectors.retain(|d| d.name() != name);
        self.detectors.push(Arc::new(detector));
    }

    /// Keep only the named detectors, in registry order.
    pub fn select(&self, names: &[String]) -> Result<Self, ExtractionError> {
        if let Some(unknown) = names
            .iter()
            .find(|n| !self.detectors.iter().any(|d| d.name() == n.as_str()))
        {
            return Err(ExtractionError::UnknownDetector(unknown.clone()));
        }
        Ok(Self {
            detectors: self
                .detectors
                .iter()
                .filter(|d| names.iter().any(|n| n == d.name()))
                .cloned()
                .collect(),
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PatternDetector>> {
        self.detectors.iter()
    }
}

// ── Query detectors ──────────────────────────────────────────────────

struct CompiledQuery {
    query: Query,
    hit: u32,
    id: Option<u32>,
}

/// A detector written as tree-sitter query patterns. Queries are compiled
/// once per grammar; an empty query means the language family is not
/// covered.
pub struct QueryDetector {
    name: &'static str,
    queries: HashMap<Language, CompiledQuery>,
}

impl QueryDetector {
    pub fn new(name: &'static str, python: &str, ecmascript: &str) -> Result<Self, ExtractionError> {
        let mut queries = HashMap::new();
        for config in LanguageConfig::get_all() {
            let source = if config.language.is_ecmascript() { ecmascript } else { python };
            if source.trim().is_empty() {
                continue;
            }
            let invalid = |detail: String| ExtractionError::InvalidQuery {
                detector: name.to_string(),
                detail,
            };
            let query = Query::new(&config.grammar, source)
                .map_err(|e| invalid(format!("{}: {e}", config.name)))?;
            let hit = query
                .capture_index_for_name("hit")
                .ok_or_else(|| invalid(format!("{}: query has no @hit capture", config.name)))?;
            let id = query.capture_index_for_name("id");
            queries.insert(config.language, CompiledQuery { query, hit, id });
        }
        Ok(Self { name, queries })
    }

    fn hit_of(&self, compiled: &CompiledQuery, m: &QueryMatch<'_, '_>, tree: &StructuralTree) -> Option<(usize, PatternHit)> {
        let hit = m.captures.iter().find(|c| c.index == compiled.hit)?.node;
        if is_error_node(hit) {
            return None;
        }
        let identifier = match compiled.id.and_then(|id| m.captures.iter().find(|c| c.index == id)) {
            Some(capture) => tree.text(capture.node).split_whitespace().collect(),
            None => compiled
                .query
                .property_settings(m.pattern_index)
                .iter()
                .find(|p| &*p.key == "identifier")
                .and_then(|p| p.value.as_deref())
                .map(str::to_string)
                .unwrap_or_else(|| tree.text(hit).to_string()),
        };
        let line = hit.start_position().row + 1;
        Some((hit.start_byte(), PatternHit { identifier, line }))
    }
}

impl PatternDetector for QueryDetector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, language: Language) -> bool {
        self.queries.contains_key(&language)
    }

    fn detect(&self, tree: &StructuralTree) -> Result<Vec<PatternHit>, ExtractionError> {
        let Some(compiled) = self.queries.get(&tree.language()) else {
            return Ok(Vec::new());
        };
        let mut cursor = QueryCursor::new();
        let mut hits = Vec::new();
        let mut matches = cursor.matches(&compiled.query, tree.root(), tree.source().as_bytes());
        while let Some(m) = matches.next() {
            if let Some(hit) = self.hit_of(compiled, m, tree) {
                hits.push(hit);
            }
        }
        hits.sort_by_key(|(start, _)| *start);
        Ok(hits.into_iter().map(|(_, hit)| hit).collect())
    }
}

/// `(name, python query, ecmascript query)`
const BUILTIN_QUERIES: [(&str, &str, &str); 8] = [
    // `except:` with no exception type
    (
        "bare-except",
        r#"((except_clause !value) @hit (#set! identifier "except"))"#,
        "",
    ),
    // `from m import *`; the identifier is the module
    (
        "star-import",
        r#"(import_from_statement module_name: (_) @id (wildcard_import) @hit)"#,
        "",
    ),
    (
        "mutable-default-argument",
        r#"
        ((default_parameter value: [(list) (list_comprehension)] @hit) (#set! identifier "list"))
        ((typed_default_parameter value: [(list) (list_comprehension)] @hit) (#set! identifier "list"))
        ((default_parameter value: [(dictionary) (dictionary_comprehension)] @hit) (#set! identifier "dict"))
        ((typed_default_parameter value: [(dictionary) (dictionary_comprehension)] @hit) (#set! identifier "dict"))
        ((default_parameter value: [(set) (set_comprehension)] @hit) (#set! identifier "set"))
        ((typed_default_parameter value: [(set) (set_comprehension)] @hit) (#set! identifier "set"))
        "#,
        "",
    ),
    // one hit per declared name
    ("global-statement", r#"(global_statement (identifier) @hit)"#, ""),
    // top-level `if __name__ == "__main__":`, either operand order
    (
        "main-guard",
        r#"
        ((module
           (if_statement condition: (comparison_operator) @cond) @hit)
         (#match? @cond "^(__name__\\s*==\\s*[\"']__main__[\"']|[\"']__main__[\"']\\s*==\\s*__name__)$")
         (#set! identifier "__main__"))
        "#,
        "",
    ),
    (
        "comprehension",
        r#"
        ((list_comprehension) @hit (#set! identifier "list"))
        ((dictionary_comprehension) @hit (#set! identifier "dict"))
        ((set_comprehension) @hit (#set! identifier "set"))
        ((generator_expression) @hit (#set! identifier "generator"))
        "#,
        "",
    ),
    // function-scoped `var` declarations
    (
        "var-declaration",
        "",
        r#"((variable_declaration) @hit (#set! identifier "var"))"#,
    ),
    (
        "loose-equality",
        "",
        r#"(binary_expression operator: ["==" "!="] @hit)"#,
    ),
];
