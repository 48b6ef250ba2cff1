use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Source languages the parser adapter has grammars for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Tsx,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Tsx => "tsx",
        }
    }

    /// Detect the language from a file extension.
    pub fn from_path(path: &Path) -> Option<Language> {
        let ext = path.extension().and_then(|e| e.to_str())?;
        LanguageConfig::get_by_extension(ext).map(|c| c.language)
    }

    /// Whether this language shares the ECMAScript syntax profile.
    pub fn is_ecmascript(&self) -> bool {
        !matches!(self, Language::Python)
    }

    pub fn config(&self) -> LanguageConfig {
        match self {
            Language::Python => python_config(),
            Language::JavaScript => javascript_config(),
            Language::TypeScript => typescript_config(),
            Language::Tsx => tsx_config(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LanguageConfig::get_by_name(&s.to_ascii_lowercase())
            .map(|c| c.language)
            .ok_or_else(|| format!("unsupported language: {s}"))
    }
}

/// Node-kind tables the fact extractor walks with.
///
/// Grammar node names differ per language; everything language-specific the
/// generic walk needs lives here so new grammars only add a table.
#[derive(Debug)]
pub struct SyntaxProfile {
    /// Nodes that open a new metric scope (functions, methods).
    pub scope_kinds: &'static [&'static str],
    /// Nodes whose name qualifies nested scopes (classes).
    pub class_kinds: &'static [&'static str],
    /// Nodes that add one decision point to cyclomatic complexity.
    pub branch_kinds: &'static [&'static str],
    /// Binary nodes counted as branches when their operator is listed below.
    pub logical_kind: Option<&'static str>,
    pub logical_operators: &'static [&'static str],
    /// Control blocks that increase nesting depth.
    pub nesting_kinds: &'static [&'static str],
    pub call_kind: &'static str,
    pub attribute_kind: &'static str,
    pub assignment_kinds: &'static [&'static str],
    pub comment_kind: &'static str,
}

pub struct LanguageConfig {
    pub name: &'static str,
    pub language: Language,
    pub grammar: tree_sitter::Language,
    pub extensions: &'static [&'static str],
    pub profile: &'static SyntaxProfile,
}

impl LanguageConfig {
    pub fn get_all() -> Vec<LanguageConfig> {
        vec![
            python_config(),
            javascript_config(),
            typescript_config(),
            tsx_config(),
        ]
    }

    pub fn get_by_extension(ext: &str) -> Option<LanguageConfig> {
        Self::get_all()
            .into_iter()
            .find(|c| c.extensions.contains(&ext))
    }

    pub fn get_by_name(name: &str) -> Option<LanguageConfig> {
        Self::get_all().into_iter().find(|c| c.name == name)
    }
}

static PYTHON_PROFILE: SyntaxProfile = SyntaxProfile {
    scope_kinds: &["function_definition"],
    class_kinds: &["class_definition"],
    branch_kinds: &[
        "if_statement",
        "elif_clause",
        "for_statement",
        "while_statement",
        "except_clause",
        "case_clause",
        "conditional_expression",
        "boolean_operator",
        "for_in_clause",
        "if_clause",
    ],
    logical_kind: None,
    logical_operators: &[],
    nesting_kinds: &[
        "if_statement",
        "for_statement",
        "while_statement",
        "try_statement",
        "with_statement",
        "match_statement",
    ],
    call_kind: "call",
    attribute_kind: "attribute",
    assignment_kinds: &["assignment", "augmented_assignment"],
    comment_kind: "comment",
};

static ECMASCRIPT_PROFILE: SyntaxProfile = SyntaxProfile {
    scope_kinds: &[
        "function_declaration",
        "function_expression",
        "function",
        "generator_function_declaration",
        "generator_function",
        "arrow_function",
        "method_definition",
    ],
    class_kinds: &["class_declaration", "class"],
    branch_kinds: &[
        "if_statement",
        "for_statement",
        "for_in_statement",
        "while_statement",
        "do_statement",
        "catch_clause",
        "switch_case",
        "ternary_expression",
    ],
    logical_kind: Some("binary_expression"),
    logical_operators: &["&&", "||", "??"],
    nesting_kinds: &[
        "if_statement",
        "for_statement",
        "for_in_statement",
        "while_statement",
        "do_statement",
        "try_statement",
        "switch_statement",
    ],
    call_kind: "call_expression",
    attribute_kind: "member_expression",
    assignment_kinds: &[
        "assignment_expression",
        "augmented_assignment_expression",
        "variable_declarator",
    ],
    comment_kind: "comment",
};

fn python_config() -> LanguageConfig {
    LanguageConfig {
        name: "python",
        language: Language::Python,
        grammar: tree_sitter_python::LANGUAGE.into(),
        extensions: &["py", "ipynb"],
        profile: &PYTHON_PROFILE,
    }
}

fn javascript_config() -> LanguageConfig {
    LanguageConfig {
        name: "javascript",
        language: Language::JavaScript,
        grammar: tree_sitter_javascript::LANGUAGE.into(),
        extensions: &["js", "jsx", "mjs", "cjs"],
        profile: &ECMASCRIPT_PROFILE,
    }
}

fn typescript_config() -> LanguageConfig {
    LanguageConfig {
        name: "typescript",
        language: Language::TypeScript,
        grammar: tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        extensions: &["ts", "mts", "cts"],
        profile: &ECMASCRIPT_PROFILE,
    }
}

fn tsx_config() -> LanguageConfig {
    LanguageConfig {
        name: "tsx",
        language: Language::Tsx,
        grammar: tree_sitter_typescript::LANGUAGE_TSX.into(),
        extensions: &["tsx"],
        profile: &ECMASCRIPT_PROFILE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_extension() {
        assert_eq!(
            Language::from_path(Path::new("pkg/mod.py")),
            Some(Language::Python)
        );
        assert_eq!(
            Language::from_path(Path::new("nb/analysis.ipynb")),
            Some(Language::Python)
        );
        assert_eq!(
            Language::from_path(Path::new("web/app.tsx")),
            Some(Language::Tsx)
        );
        assert_eq!(Language::from_path(Path::new("README.md")), None);
    }

    #[test]
    fn test_parse_language_tag() {
        assert_eq!("Python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(
            "javascript".parse::<Language>().unwrap(),
            Language::JavaScript
        );
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_serde_tag_matches_name() {
        for config in LanguageConfig::get_all() {
            let json = serde_json::to_string(&config.language).unwrap();
            assert_eq!(json, format!("\"{}\"", config.name));
        }
    }
}
