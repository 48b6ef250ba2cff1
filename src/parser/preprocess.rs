//! Source clean-up applied before parsing.
//!
//! Corpus files are frequently not what their extension promises: notebooks
//! stored as `.py`, half-resolved merge conflicts, stray NUL bytes from broken
//! exports. Each step is switchable through [`PreprocessOptions`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use tracing::debug;

use super::languages::Language;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreprocessOptions {
    #[serde(default = "default_true")]
    pub strip_nul: bool,

    #[serde(default = "default_true")]
    pub notebooks: bool,

    #[serde(default = "default_true")]
    pub merge_conflicts: bool,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            strip_nul: true,
            notebooks: true,
            merge_conflicts: true,
        }
    }
}

/// Apply the enabled clean-up steps in order: NUL stripping, notebook code
/// extraction (Python only), merge-conflict removal.
pub fn clean<'a>(source: &'a str, language: Language, opts: &PreprocessOptions) -> Cow<'a, str> {
    let mut text = Cow::Borrowed(source);

    if opts.strip_nul && text.contains('\0') {
        text = Cow::Owned(text.replace('\0', ""));
    }

    if opts.notebooks && language == Language::Python && is_notebook(&text) {
        text = Cow::Owned(extract_notebook_code(&text));
    }

    if opts.merge_conflicts && has_conflict_markers(&text) {
        text = Cow::Owned(remove_merge_conflicts(&text));
    }

    text
}

/// Whether the text looks like a Jupyter notebook document.
pub fn is_notebook(text: &str) -> bool {
    text.contains("\"cell_type\": \"code\"") || text.contains("\"cell_type\": \"markdown\"")
}

/// Concatenate the code cells of a notebook, dropping `%` magic lines.
///
/// Every non-empty code cell is terminated by a newline. Text that does not
/// deserialize as a notebook yields an empty string.
pub fn extract_notebook_code(text: &str) -> String {
    let doc: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("notebook parsing error: {e}");
            return String::new();
        }
    };

    let Some(cells) = doc.get("cells").and_then(Value::as_array) else {
        return String::new();
    };

    let mut extracted = String::new();
    for cell in cells {
        if cell.get("cell_type").and_then(Value::as_str) != Some("code") {
            continue;
        }
        let lines = cell_source_lines(cell.get("source"));
        if lines.is_empty() || (lines.len() == 1 && lines[0].is_empty()) {
            continue;
        }
        for line in lines {
            if line.starts_with('%') {
                continue;
            }
            extracted.push_str(&line);
        }
        extracted.push('\n');
    }
    extracted
}

/// nbformat allows `source` as a list of lines or as one string.
fn cell_source_lines(source: Option<&Value>) -> Vec<String> {
    match source {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) => s.split_inclusive('\n').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn has_conflict_markers(text: &str) -> bool {
    text.lines()
        .any(|l| l.starts_with("<<<<<<<") || l.starts_with(">>>>>>>"))
}

/// Drop merge-conflict blocks.
///
/// Lines from `<<<<<<<` through `=======` are removed together with the
/// `>>>>>>>` marker, which keeps the incoming side of each conflict.
pub fn remove_merge_conflicts(text: &str) -> String {
    let mut kept = Vec::new();
    let mut in_conflict = false;

    for line in text.lines() {
        if line.starts_with("<<<<<<<") {
            in_conflict = true;
            continue;
        } else if line.starts_with("=======") {
            in_conflict = false;
            continue;
        } else if line.starts_with(">>>>>>>") {
            continue;
        }
        if !in_conflict {
            kept.push(line);
        }
    }

    kept.join("\n")
}
