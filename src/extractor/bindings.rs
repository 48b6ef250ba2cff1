//! Static name binding with lexical scopes.
//!
//! Functions, lambdas, classes and Python comprehensions each open a scope.
//! Imports, parameters, assignment targets and def/class names bind in the
//! scope they occur in and shadow every outer binding of the same name.
//! Within one scope the binding closest before the call wins.
use std::collections::{HashMap, HashSet};
use tree_sitter::Node;

use crate::parser::{is_error_node, Language, StructuralTree, SyntaxProfile};

/// Longest literal callee text kept for unresolved calls.
pub const MAX_CALLEE_CHARS: usize = 200;

/// Python builtins resolved to `builtins.<name>` when called bare.
const PYTHON_BUILTINS: &[&str] = &[
    "abs", "aiter", "all", "anext", "any", "ascii", "bin", "bool", "breakpoint", "bytearray",
    "bytes", "callable", "chr", "classmethod", "compile", "complex", "copyright", "credits",
    "delattr", "dict", "dir", "divmod", "enumerate", "eval", "exec", "exit", "filter", "float",
    "format", "frozenset", "getattr", "globals", "hasattr", "hash", "help", "hex", "id", "input",
    "int", "isinstance", "issubclass", "iter", "len", "license", "list", "locals", "map", "max",
    "memoryview", "min", "next", "object", "oct", "open", "ord", "pow", "print", "property",
    "quit", "range", "repr", "reversed", "round", "set", "setattr", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip", "__import__",
];

/// Python nodes that open a function-like scope besides `def`.
const PYTHON_INNER_SCOPES: &[&str] = &[
    "lambda",
    "list_comprehension",
    "set_comprehension",
    "dictionary_comprehension",
    "generator_expression",
];

/// Index of a scope in [`Bindings`]; the module scope is always 0.
pub type ScopeId = usize;

pub const MODULE_SCOPE_ID: ScopeId = 0;

/// One imported symbol: the module it comes from and, for member imports,
/// the fully-qualified member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub module: String,
    pub member: Option<String>,
}

/// Outcome of resolving a callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    Resolved(String),
    Unresolved(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Function,
    Class,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    /// Refers to an imported module or member.
    Import(String),
    /// Defined by the unit itself.
    Local,
}

enum Visible<'a> {
    Import(&'a str),
    Local,
    Unbound,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    parent: Option<ScopeId>,
    /// name → bindings with the byte offset each takes effect at
    names: HashMap<String, Vec<(usize, Binding)>>,
    /// `global` names, looked up in the module scope
    global: HashSet<String>,
    /// `nonlocal` names, looked up in the enclosing scopes
    nonlocal: HashSet<String>,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            names: HashMap::new(),
            global: HashSet::new(),
            nonlocal: HashSet::new(),
        }
    }
}

#[derive(Debug)]
pub struct Bindings {
    scopes: Vec<Scope>,
    /// scope-opening node id → the scope it opens
    opened_by: HashMap<usize, ScopeId>,
    language: Language,
}

impl Bindings {
    /// Collect the scopes and bindings of the whole unit before the fact walk
    /// starts.
    pub fn collect(tree: &StructuralTree) -> Self {
        let mut bindings = Bindings {
            scopes: vec![Scope::new(ScopeKind::Module, None)],
            opened_by: HashMap::new(),
            language: tree.language(),
        };
        let python = tree.language() == Language::Python;
        let profile = tree.language().config().profile;

        let mut stack = vec![(tree.root(), MODULE_SCOPE_ID)];
        while let Some((node, scope)) = stack.pop() {
            if is_error_node(node) {
                continue;
            }
            let inner = if python {
                bindings.collect_python(tree, node, scope)
            } else {
                bindings.collect_ecmascript(tree, profile, node, scope)
            };
            let mut cursor = node.walk();
            let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev().map(|child| (child, inner)));
        }
        bindings
    }

    /// The scope `node` opens, if it opens one.
    pub fn scope_opened_by(&self, node: Node<'_>) -> Option<ScopeId> {
        self.opened_by.get(&node.id()).copied()
    }

    fn open(&mut self, node: Node<'_>, kind: ScopeKind, parent: ScopeId) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope::new(kind, Some(parent)));
        self.opened_by.insert(node.id(), id);
        id
    }

    fn bind(&mut self, scope: ScopeId, local: String, at: usize, binding: Binding) {
        self.scopes[scope]
            .names
            .entry(local)
            .or_default()
            .push((at, binding));
    }

    fn bind_names(&mut self, tree: &StructuralTree, scope: ScopeId, target: Node<'_>, at: usize) {
        let mut names = Vec::new();
        pattern_names(target, &mut names);
        for name in names {
            self.bind(scope, tree.text(name).to_string(), at, Binding::Local);
        }
    }

    // ── Python ───────────────────────────────────────────────────────

    /// Record what `node` binds in `scope`; returns the scope its children
    /// belong to.
    fn collect_python(&mut self, tree: &StructuralTree, node: Node<'_>, scope: ScopeId) -> ScopeId {
        let end = node.end_byte();
        match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
                for name in names {
                    if name.kind() == "aliased_import" {
                        if let (Some(module), Some(alias)) = (
                            name.child_by_field_name("name"),
                            name.child_by_field_name("alias"),
                        ) {
                            let target = Binding::Import(compact(tree.text(module)));
                            self.bind(scope, compact(tree.text(alias)), end, target);
                        }
                    } else {
                        // `import a.b.c` binds `a`
                        let dotted = compact(tree.text(name));
                        let head = dotted.split('.').next().unwrap_or_default().to_string();
                        self.bind(scope, head.clone(), end, Binding::Import(head));
                    }
                }
            }
            "import_from_statement" | "future_import_statement" => {
                let Some(module) = python_from_module(tree, node) else {
                    return scope;
                };
                let mut cursor = node.walk();
                let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
                for name in names {
                    let (member, local) = if name.kind() == "aliased_import" {
                        match (
                            name.child_by_field_name("name"),
                            name.child_by_field_name("alias"),
                        ) {
                            (Some(m), Some(a)) => (compact(tree.text(m)), compact(tree.text(a))),
                            _ => continue,
                        }
                    } else {
                        let m = compact(tree.text(name));
                        (m.clone(), m)
                    };
                    self.bind(scope, local, end, Binding::Import(qualify(&module, &member)));
                }
            }
            "function_definition" | "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.bind(scope, tree.text(name).to_string(), end, Binding::Local);
                }
                let kind = if node.kind() == "class_definition" {
                    ScopeKind::Class
                } else {
                    ScopeKind::Function
                };
                return self.open(node, kind, scope);
            }
            kind if PYTHON_INNER_SCOPES.contains(&kind) => {
                return self.open(node, ScopeKind::Function, scope);
            }
            "parameters" | "lambda_parameters" => {
                let at = node.start_byte();
                let mut cursor = node.walk();
                let params: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
                for param in params {
                    self.bind_names(tree, scope, param, at);
                }
            }
            "assignment" | "augmented_assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.bind_names(tree, scope, left, end);
                }
            }
            "for_statement" | "for_in_clause" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.bind_names(tree, scope, left, left.end_byte());
                }
            }
            "named_expression" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.bind_names(tree, scope, name, end);
                }
            }
            "as_pattern" | "except_clause" => {
                if let Some(alias) = node.child_by_field_name("alias") {
                    self.bind_names(tree, scope, alias, alias.end_byte());
                }
            }
            "global_statement" | "nonlocal_statement" => {
                let global = node.kind() == "global_statement";
                let mut cursor = node.walk();
                let names: Vec<String> = node
                    .named_children(&mut cursor)
                    .filter(|n| n.kind() == "identifier")
                    .map(|n| tree.text(n).to_string())
                    .collect();
                let target = &mut self.scopes[scope];
                if global {
                    target.global.extend(names);
                } else {
                    target.nonlocal.extend(names);
                }
            }
            _ => {}
        }
        scope
    }

    // ── JavaScript / TypeScript ──────────────────────────────────────

    fn collect_ecmascript(
        &mut self,
        tree: &StructuralTree,
        profile: &SyntaxProfile,
        node: Node<'_>,
        scope: ScopeId,
    ) -> ScopeId {
        let kind = node.kind();
        let end = node.end_byte();

        if profile.scope_kinds.contains(&kind) {
            // declarations are hoisted to the top of the enclosing scope
            if matches!(kind, "function_declaration" | "generator_function_declaration") {
                if let Some(name) = node.child_by_field_name("name") {
                    self.bind(scope, tree.text(name).to_string(), node.start_byte(), Binding::Local);
                }
            }
            let inner = self.open(node, ScopeKind::Function, scope);
            // `p => …` has a bare parameter instead of formal_parameters
            if let Some(param) = node.child_by_field_name("parameter") {
                self.bind_names(tree, inner, param, node.start_byte());
            }
            return inner;
        }
        if profile.class_kinds.contains(&kind) {
            if kind == "class_declaration" {
                if let Some(name) = node.child_by_field_name("name") {
                    self.bind(scope, tree.text(name).to_string(), end, Binding::Local);
                }
            }
            return self.open(node, ScopeKind::Class, scope);
        }

        match kind {
            "import_statement" => {
                let Some(module) = node.child_by_field_name("source").map(|s| unquote(tree.text(s)))
                else {
                    return scope;
                };
                let mut cursor = node.walk();
                let clauses: Vec<Node<'_>> = node
                    .named_children(&mut cursor)
                    .filter(|c| c.kind() == "import_clause")
                    .collect();
                for clause in clauses {
                    let mut cursor = clause.walk();
                    let parts: Vec<Node<'_>> = clause.named_children(&mut cursor).collect();
                    for part in parts {
                        match part.kind() {
                            "identifier" => {
                                let target = Binding::Import(module.clone());
                                self.bind(scope, tree.text(part).to_string(), end, target);
                            }
                            "namespace_import" => {
                                if let Some(ident) = first_named_of_kind(part, "identifier") {
                                    let target = Binding::Import(module.clone());
                                    self.bind(scope, tree.text(ident).to_string(), end, target);
                                }
                            }
                            "named_imports" => {
                                let mut cursor = part.walk();
                                let specs: Vec<Node<'_>> = part
                                    .named_children(&mut cursor)
                                    .filter(|s| s.kind() == "import_specifier")
                                    .collect();
                                for spec in specs {
                                    let Some(name) = spec.child_by_field_name("name") else {
                                        continue;
                                    };
                                    let member = unquote(tree.text(name));
                                    let local = spec
                                        .child_by_field_name("alias")
                                        .map(|a| tree.text(a).to_string())
                                        .unwrap_or_else(|| member.clone());
                                    let target = Binding::Import(format!("{module}.{member}"));
                                    self.bind(scope, local, end, target);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
            "variable_declarator" => {
                let Some(name) = node.child_by_field_name("name") else {
                    return scope;
                };
                let module = node
                    .child_by_field_name("value")
                    .and_then(|value| require_module(tree, value));
                match (module, name.kind()) {
                    (Some(module), "identifier") => {
                        self.bind(scope, tree.text(name).to_string(), end, Binding::Import(module));
                    }
                    (Some(module), "object_pattern") => {
                        for (member, local) in destructured_names(tree, name) {
                            let target = Binding::Import(format!("{module}.{member}"));
                            self.bind(scope, local, end, target);
                        }
                    }
                    _ => self.bind_names(tree, scope, name, end),
                }
            }
            "formal_parameters" => {
                let at = node.start_byte();
                let mut cursor = node.walk();
                let params: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
                for param in params {
                    self.bind_names(tree, scope, param, at);
                }
            }
            "assignment_expression" | "for_in_statement" => {
                if let Some(left) = node.child_by_field_name("left") {
                    self.bind_names(tree, scope, left, left.end_byte());
                }
            }
            "catch_clause" => {
                if let Some(param) = node.child_by_field_name("parameter") {
                    self.bind_names(tree, scope, param, param.start_byte());
                }
            }
            _ => {}
        }
        scope
    }

    // ── Resolution ───────────────────────────────────────────────────

    /// What `name` refers to at byte offset `at` inside `scope`.
    ///
    /// The innermost scope only sees bindings made before `at`; a function
    /// scope that binds the name later still owns it. Enclosing scopes are
    /// looked up as they stand once fully executed, class bodies excepted.
    fn lookup(&self, scope: ScopeId, name: &str, at: usize) -> Visible<'_> {
        let mut current = Some(scope);
        let mut innermost = true;
        while let Some(id) = current {
            let frame = &self.scopes[id];
            current = frame.parent;

            if id != MODULE_SCOPE_ID && frame.global.contains(name) {
                current = Some(MODULE_SCOPE_ID);
                innermost = false;
                continue;
            }
            if frame.nonlocal.contains(name) || (!innermost && frame.kind == ScopeKind::Class) {
                innermost = false;
                continue;
            }

            if let Some(entries) = frame.names.get(name) {
                let visible = entries
                    .iter()
                    .filter(|(pos, _)| !innermost || *pos <= at)
                    .max_by_key(|(pos, _)| *pos);
                match visible {
                    Some((_, Binding::Import(target))) => return Visible::Import(target),
                    Some((_, Binding::Local)) => return Visible::Local,
                    None if frame.kind == ScopeKind::Function => return Visible::Local,
                    None => {}
                }
            }
            innermost = false;
        }
        Visible::Unbound
    }

    /// Resolve the `function` child of a call made inside `scope`.
    pub fn resolve(&self, tree: &StructuralTree, callee: Node<'_>, scope: ScopeId) -> Callee {
        let chain = dotted_chain(tree, callee).unwrap_or_default();
        if let Some((head, rest)) = chain.split_first() {
            match self.lookup(scope, head, callee.start_byte()) {
                Visible::Import(target) => {
                    let mut resolved = target.to_string();
                    for part in rest {
                        resolved.push('.');
                        resolved.push_str(part);
                    }
                    return Callee::Resolved(resolved);
                }
                Visible::Unbound
                    if rest.is_empty()
                        && self.language == Language::Python
                        && PYTHON_BUILTINS.contains(&head.as_str()) =>
                {
                    return Callee::Resolved(format!("builtins.{head}"));
                }
                _ => {}
            }
        }
        Callee::Unresolved(callee_text(tree.text(callee)))
    }
}

/// Imports declared by `node`, one entry per imported symbol. Empty for
/// nodes that are not import-like.
pub fn imports_of(tree: &StructuralTree, node: Node<'_>) -> Vec<ImportRef> {
    match (tree.language(), node.kind()) {
        (Language::Python, "import_statement") => {
            let mut cursor = node.walk();
            node.children_by_field_name("name", &mut cursor)
                .filter_map(|name| {
                    let module = if name.kind() == "aliased_import" {
                        name.child_by_field_name("name")?
                    } else {
                        name
                    };
                    Some(ImportRef {
                        module: compact(tree.text(module)),
                        member: None,
                    })
                })
                .collect()
        }
        (Language::Python, "import_from_statement" | "future_import_statement") => {
            let Some(module) = python_from_module(tree, node) else {
                return Vec::new();
            };
            if first_named_of_kind(node, "wildcard_import").is_some() {
                return vec![ImportRef { module, member: None }];
            }
            let mut cursor = node.walk();
            node.children_by_field_name("name", &mut cursor)
                .filter_map(|name| {
                    let member = if name.kind() == "aliased_import" {
                        name.child_by_field_name("name")?
                    } else {
                        name
                    };
                    Some(ImportRef {
                        member: Some(qualify(&module, &compact(tree.text(member)))),
                        module: module.clone(),
                    })
                })
                .collect()
        }
        (Language::Python, _) => Vec::new(),
        (_, "import_statement") => ecmascript_imports(tree, node),
        (_, "call_expression") => {
            let Some(module) = require_module(tree, node) else {
                return Vec::new();
            };
            let destructured = node
                .parent()
                .filter(|p| p.kind() == "variable_declarator")
                .and_then(|p| p.child_by_field_name("name"))
                .filter(|n| n.kind() == "object_pattern");
            match destructured {
                Some(pattern) => destructured_names(tree, pattern)
                    .into_iter()
                    .map(|(member, _)| ImportRef {
                        member: Some(format!("{module}.{member}")),
                        module: module.clone(),
                    })
                    .collect(),
                None => vec![ImportRef { module, member: None }],
            }
        }
        _ => Vec::new(),
    }
}

fn ecmascript_imports(tree: &StructuralTree, node: Node<'_>) -> Vec<ImportRef> {
    let Some(module) = node.child_by_field_name("source").map(|s| unquote(tree.text(s))) else {
        return Vec::new();
    };
    let mut refs = Vec::new();
    let mut cursor = node.walk();
    let clauses: Vec<Node<'_>> = node
        .named_children(&mut cursor)
        .filter(|c| c.kind() == "import_clause")
        .collect();

    for clause in &clauses {
        let mut cursor = clause.walk();
        for part in clause.named_children(&mut cursor) {
            match part.kind() {
                "identifier" | "namespace_import" => refs.push(ImportRef {
                    module: module.clone(),
                    member: None,
                }),
                "named_imports" => {
                    let mut cursor = part.walk();
                    for spec in part.named_children(&mut cursor) {
                        if spec.kind() != "import_specifier" {
                            continue;
                        }
                        if let Some(name) = spec.child_by_field_name("name") {
                            refs.push(ImportRef {
                                module: module.clone(),
                                member: Some(format!("{module}.{}", unquote(tree.text(name)))),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // side-effect import: `import './polyfill'`
    if clauses.is_empty() {
        refs.push(ImportRef { module, member: None });
    }
    refs
}

/// `m` for `require('m')` (the call node itself).
pub fn require_module(tree: &StructuralTree, node: Node<'_>) -> Option<String> {
    if node.kind() != "call_expression" {
        return None;
    }
    let function = node.child_by_field_name("function")?;
    if function.kind() != "identifier" || tree.text(function) != "require" {
        return None;
    }
    let arguments = node.child_by_field_name("arguments")?;
    let mut cursor = arguments.walk();
    let first = arguments.named_children(&mut cursor).next()?;
    (first.kind() == "string").then(|| unquote(tree.text(first)))
}

/// `(member, local)` pairs of `{ a, b: c }`.
fn destructured_names(tree: &StructuralTree, pattern: Node<'_>) -> Vec<(String, String)> {
    let mut names = Vec::new();
    let mut cursor = pattern.walk();
    for prop in pattern.named_children(&mut cursor) {
        match prop.kind() {
            "shorthand_property_identifier_pattern" => {
                let name = tree.text(prop).to_string();
                names.push((name.clone(), name));
            }
            "pair_pattern" => {
                if let (Some(key), Some(value)) = (
                    prop.child_by_field_name("key"),
                    prop.child_by_field_name("value"),
                ) {
                    if value.kind() == "identifier" {
                        names.push((unquote(tree.text(key)), tree.text(value).to_string()));
                    }
                }
            }
            _ => {}
        }
    }
    names
}

/// Identifiers a binding target introduces: plain names, and the names
/// inside tuple/list/object patterns. Attribute and subscript targets bind
/// nothing; default values and type annotations are skipped.
fn pattern_names<'t>(node: Node<'t>, out: &mut Vec<Node<'t>>) {
    match node.kind() {
        "identifier" | "shorthand_property_identifier_pattern" => out.push(node),
        "attribute" | "subscript" | "member_expression" | "subscript_expression" | "call"
        | "call_expression" | "type_annotation" => {}
        "pair_pattern" => {
            if let Some(value) = node.child_by_field_name("value") {
                pattern_names(value, out);
            }
        }
        _ => {
            let mut cursor = node.walk();
            let mut more = cursor.goto_first_child();
            while more {
                if !matches!(cursor.field_name(), Some("value" | "right" | "type" | "default")) {
                    pattern_names(cursor.node(), out);
                }
                more = cursor.goto_next_sibling();
            }
        }
    }
}

/// Module of a `from … import` statement, keeping relative dots.
fn python_from_module(tree: &StructuralTree, node: Node<'_>) -> Option<String> {
    if node.kind() == "future_import_statement" {
        return Some("__future__".to_string());
    }
    node.child_by_field_name("module_name")
        .map(|m| compact(tree.text(m)))
}

fn first_named_of_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let found = node.named_children(&mut cursor).find(|c| c.kind() == kind);
    found
}

/// `a.b.c` as `[a, b, c]` when the callee is a plain identifier/attribute chain.
fn dotted_chain(tree: &StructuralTree, node: Node<'_>) -> Option<Vec<String>> {
    let (object_field, member_field) = match tree.language() {
        Language::Python => ("object", "attribute"),
        _ => ("object", "property"),
    };
    let member_kind = tree.language().config().profile.attribute_kind;

    let mut parts = Vec::new();
    let mut current = node;
    loop {
        match current.kind() {
            "identifier" => {
                parts.push(tree.text(current).to_string());
                break;
            }
            kind if kind == member_kind => {
                let member = current.child_by_field_name(member_field)?;
                parts.push(tree.text(member).to_string());
                current = current.child_by_field_name(object_field)?;
            }
            _ => return None,
        }
    }
    parts.reverse();
    Some(parts)
}

/// `m` + `x` → `m.x`; `.` + `x` → `.x`.
fn qualify(module: &str, member: &str) -> String {
    if module.ends_with('.') {
        format!("{module}{member}")
    } else {
        format!("{module}.{member}")
    }
}

fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn unquote(text: &str) -> String {
    text.trim_matches(|c| c == '"' || c == '\'' || c == '`').to_string()
}

/// Literal callee text, whitespace collapsed and length-bounded.
pub fn callee_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(MAX_CALLEE_CHARS) {
        Some((cut, _)) => collapsed[..cut].to_string(),
        None => collapsed,
    }
}
