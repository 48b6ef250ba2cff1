//! Parser adapter: raw bytes → tree-sitter syntax tree.
//!
//! Each call builds its own `tree_sitter::Parser`; only the static grammar
//! tables are shared, so parsing is reentrant and the same bytes always
//! produce the same tree.
pub mod languages;
pub mod preprocess;

use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::Instant;
use thiserror::Error;
use tree_sitter::{Node, Parser, Point, Tree};

pub use languages::{Language, LanguageConfig, SyntaxProfile};
pub use preprocess::PreprocessOptions;

/// Why a unit could not be turned into a usable tree.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseFailure {
    #[error("syntax error at line {line}, column {column}")]
    Syntax { line: usize, column: usize },

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("invalid utf-8 at byte {offset}")]
    Encoding { offset: usize },

    #[error("parser produced no tree")]
    NoTree,

    #[error("parse ran past its deadline")]
    DeadlineExceeded,
}

// ── Options ──────────────────────────────────────────────────────────

fn default_max_depth() -> usize {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseOptions {
    /// Accept trees with recovered error nodes instead of failing the unit.
    #[serde(default)]
    pub partial_trees: bool,

    /// Deepest node nesting accepted before the unit is rejected.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(flatten)]
    pub preprocess: PreprocessOptions,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            partial_trees: false,
            max_depth: default_max_depth(),
            preprocess: PreprocessOptions::default(),
        }
    }
}

// ── Structural tree ──────────────────────────────────────────────────

/// Region of the source the grammar could only parse through error recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorSpan {
    pub start_byte: usize,
    pub end_byte: usize,
    /// 1-based
    pub line: usize,
    /// 1-based, in bytes
    pub column: usize,
}

impl ErrorSpan {
    fn of(node: Node<'_>) -> Self {
        let start = node.start_position();
        Self {
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            line: start.row + 1,
            column: start.column + 1,
        }
    }
}

/// A parsed unit. Owns the tree and the cleaned text it was parsed from.
pub struct StructuralTree {
    tree: Tree,
    source: String,
    language: Language,
    error_spans: Vec<ErrorSpan>,
}

impl StructuralTree {
    pub fn root(&self) -> Node<'_> {
        self.tree.root_node()
    }

    /// The cleaned source the tree was built from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn error_spans(&self) -> &[ErrorSpan] {
        &self.error_spans
    }

    pub fn is_partial(&self) -> bool {
        !self.error_spans.is_empty()
    }

    /// Source text covered by `node`.
    pub fn text(&self, node: Node<'_>) -> &str {
        self.source
            .get(node.start_byte()..node.end_byte())
            .unwrap_or_default()
    }

    /// True when the unit holds no statements (blank or comments only).
    pub fn is_empty(&self) -> bool {
        let comment = self.language.config().profile.comment_kind;
        let root = self.root();
        let mut cursor = root.walk();
        let empty = !root
            .named_children(&mut cursor)
            .any(|child| child.kind() != comment);
        empty
    }

    /// Pre-order walk that never enters error or missing nodes.
    ///
    /// `f` returns whether to descend into the node it was given.
    pub fn visit<'t>(&'t self, mut f: impl FnMut(Node<'t>) -> bool) {
        let mut stack = vec![self.root()];
        while let Some(node) = stack.pop() {
            if is_error_node(node) {
                continue;
            }
            if !f(node) {
                continue;
            }
            let mut cursor = node.walk();
            let children: Vec<Node<'t>> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
    }
}

pub(crate) fn is_error_node(node: Node<'_>) -> bool {
    node.is_error() || node.is_missing()
}

// ── Adapter ──────────────────────────────────────────────────────────

pub struct ParserAdapter {
    options: ParseOptions,
}

impl ParserAdapter {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Parse `content` as `language`.
    pub fn parse(&self, content: &[u8], language: Language) -> Result<StructuralTree, ParseFailure> {
        self.parse_inner(content, language, None)
    }

    /// Parse, giving up with [`ParseFailure::DeadlineExceeded`] once
    /// `deadline` passes. Tree-sitter polls the deadline while it parses.
    pub fn parse_until(
        &self,
        content: &[u8],
        language: Language,
        deadline: Instant,
    ) -> Result<StructuralTree, ParseFailure> {
        self.parse_inner(content, language, Some(deadline))
    }

    fn parse_inner(
        &self,
        content: &[u8],
        language: Language,
        deadline: Option<Instant>,
    ) -> Result<StructuralTree, ParseFailure> {
        let text = std::str::from_utf8(content).map_err(|e| ParseFailure::Encoding {
            offset: e.valid_up_to(),
        })?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let source = preprocess::clean(text, language, &self.options.preprocess).into_owned();

        let config = language.config();
        let mut parser = Parser::new();
        parser
            .set_language(&config.grammar)
            .map_err(|e| ParseFailure::UnsupportedLanguage(format!("{language}: {e}")))?;

        let bytes = source.as_bytes();
        let mut input = |offset: usize, _: Point| bytes.get(offset..).unwrap_or_default();
        let tree = match deadline {
            Some(deadline) => {
                let mut progress = |_: &tree_sitter::ParseState| {
                    if Instant::now() >= deadline {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                };
                let options = tree_sitter::ParseOptions::new().progress_callback(&mut progress);
                parser
                    .parse_with_options(&mut input, None, Some(options))
                    .ok_or_else(|| {
                        if Instant::now() >= deadline {
                            ParseFailure::DeadlineExceeded
                        } else {
                            ParseFailure::NoTree
                        }
                    })?
            }
            None => parser.parse(bytes, None).ok_or(ParseFailure::NoTree)?,
        };
        let root = tree.root_node();

        if exceeds_depth(root, self.options.max_depth) {
            return Err(ParseFailure::Unsupported(format!(
                "syntax tree nested deeper than {} levels",
                self.options.max_depth
            )));
        }

        let error_spans = if root.has_error() {
            collect_error_spans(root)
        } else {
            Vec::new()
        };

        if let Some(first) = error_spans.first() {
            if !self.options.partial_trees || is_unrecoverable(root, config.profile) {
                return Err(ParseFailure::Syntax {
                    line: first.line,
                    column: first.column,
                });
            }
        }

        Ok(StructuralTree {
            tree,
            source,
            language,
            error_spans,
        })
    }
}

fn exceeds_depth(root: Node<'_>, limit: usize) -> bool {
    let mut cursor = root.walk();
    let mut depth = 0usize;
    loop {
        if cursor.goto_first_child() {
            depth += 1;
            if depth > limit {
                return true;
            }
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return false;
            }
            depth -= 1;
        }
    }
}

/// Outermost error/missing nodes in document order.
fn collect_error_spans(root: Node<'_>) -> Vec<ErrorSpan> {
    let mut spans = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if is_error_node(node) {
            spans.push(ErrorSpan::of(node));
            continue;
        }
        if !node.has_error() {
            continue;
        }
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    spans
}

/// A partial tree is useless when the root itself, or every top-level
/// statement, is an error.
fn is_unrecoverable(root: Node<'_>, profile: &SyntaxProfile) -> bool {
    if is_error_node(root) {
        return true;
    }
    let mut cursor = root.walk();
    let statements: Vec<Node<'_>> = root
        .named_children(&mut cursor)
        .filter(|n| n.kind() != profile.comment_kind)
        .collect();
    !statements.is_empty() && statements.iter().all(|n| is_error_node(*n))
}
