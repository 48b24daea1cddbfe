//! Tree-sitter based boundary extraction
//!
//! Tree-sitter parsers are expensive to create but reusable across files of
//! the same language, so each rayon worker thread keeps its own pool. The
//! grammar tables below map raw tree-sitter node kinds to the engine's
//! declaration boundaries; everything the tables do not name is either
//! skipped or, at the top level, kept as an `Other` boundary so script-style
//! files still get full coverage.

use super::{NodeKind, SyntaxNode};
use crate::error::ParseError;
use crate::source::{Language, SourceUnit};
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tree_sitter::Parser;

/// Concrete grammar to load; TypeScript splits into ts/tsx variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Grammar {
    Rust,
    JavaScript,
    TypeScript,
    Tsx,
    Python,
    Go,
}

thread_local! {
    static PARSERS: RefCell<HashMap<Grammar, Parser>> = RefCell::new(HashMap::new());
}

fn grammar_language(grammar: Grammar) -> tree_sitter::Language {
    match grammar {
        Grammar::Rust => tree_sitter_rust::LANGUAGE.into(),
        Grammar::JavaScript => tree_sitter_javascript::LANGUAGE.into(),
        Grammar::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        Grammar::Tsx => tree_sitter_typescript::LANGUAGE_TSX.into(),
        Grammar::Python => tree_sitter_python::LANGUAGE.into(),
        Grammar::Go => tree_sitter_go::LANGUAGE.into(),
    }
}

fn grammar_for(unit: &SourceUnit) -> Result<Grammar, ParseError> {
    let grammar = match unit.language {
        Language::Rust => Grammar::Rust,
        Language::JavaScript => Grammar::JavaScript,
        Language::TypeScript => {
            let tsx = unit
                .path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("tsx"))
                .unwrap_or(false);
            if tsx {
                Grammar::Tsx
            } else {
                Grammar::TypeScript
            }
        }
        Language::Python => Grammar::Python,
        Language::Go => Grammar::Go,
        Language::Unknown => {
            return Err(ParseError::UnsupportedLanguage {
                path: unit.path.clone(),
            })
        }
    };
    Ok(grammar)
}

/// Parse with a thread-local pooled parser for the unit's grammar.
fn parse_pooled(unit: &SourceUnit) -> Result<tree_sitter::Tree, ParseError> {
    let grammar = grammar_for(unit)?;

    PARSERS.with(|cell| {
        let mut parsers = cell.borrow_mut();
        let parser = match parsers.entry(grammar) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(slot) => {
                let mut parser = Parser::new();
                parser
                    .set_language(&grammar_language(grammar))
                    .map_err(|e| ParseError::ParserFailed {
                        path: unit.path.clone(),
                        message: e.to_string(),
                    })?;
                slot.insert(parser)
            }
        };

        parser
            .parse(&unit.text, None)
            .ok_or_else(|| ParseError::ParserFailed {
                path: unit.path.clone(),
                message: "parser produced no tree".to_string(),
            })
    })
}

/// Which tree-sitter node kinds count as which boundary, per language.
struct GrammarSpec {
    functions: &'static [&'static str],
    types: &'static [&'static str],
    containers: &'static [&'static str],
    modules: &'static [&'static str],
    imports: &'static [&'static str],
    /// Kinds unwrapped to the declaration they carry (exports, decorators)
    wrappers: &'static [&'static str],
}

const RUST_SPEC: GrammarSpec = GrammarSpec {
    functions: &["function_item", "function_signature_item"],
    types: &[
        "struct_item",
        "enum_item",
        "union_item",
        "type_item",
        "const_item",
        "static_item",
        "macro_definition",
    ],
    containers: &["impl_item", "trait_item"],
    modules: &["mod_item"],
    imports: &["use_declaration", "extern_crate_declaration"],
    wrappers: &[],
};

const JS_SPEC: GrammarSpec = GrammarSpec {
    functions: &[
        "function_declaration",
        "generator_function_declaration",
        "method_definition",
    ],
    types: &[],
    containers: &["class_declaration"],
    modules: &[],
    imports: &["import_statement"],
    wrappers: &["export_statement"],
};

const TS_SPEC: GrammarSpec = GrammarSpec {
    functions: &[
        "function_declaration",
        "generator_function_declaration",
        "method_definition",
        "method_signature",
        "function_signature",
    ],
    types: &[
        "interface_declaration",
        "type_alias_declaration",
        "enum_declaration",
    ],
    containers: &["class_declaration", "abstract_class_declaration"],
    modules: &["module", "internal_module"],
    imports: &["import_statement"],
    wrappers: &["export_statement", "ambient_declaration"],
};

const PYTHON_SPEC: GrammarSpec = GrammarSpec {
    functions: &["function_definition"],
    types: &[],
    containers: &["class_definition"],
    modules: &[],
    imports: &[
        "import_statement",
        "import_from_statement",
        "future_import_statement",
    ],
    wrappers: &["decorated_definition"],
};

const GO_SPEC: GrammarSpec = GrammarSpec {
    functions: &["function_declaration", "method_declaration"],
    types: &["type_declaration", "const_declaration", "var_declaration"],
    containers: &[],
    modules: &[],
    imports: &["import_declaration"],
    wrappers: &[],
};

fn spec_for(language: Language) -> &'static GrammarSpec {
    match language {
        Language::Rust => &RUST_SPEC,
        Language::JavaScript => &JS_SPEC,
        Language::TypeScript => &TS_SPEC,
        Language::Python => &PYTHON_SPEC,
        Language::Go => &GO_SPEC,
        // grammar_for rejects Unknown before we get here
        Language::Unknown => &RUST_SPEC,
    }
}

/// Extract top-level declaration boundaries for one unit.
pub fn extract_boundaries(unit: &SourceUnit) -> Result<Vec<SyntaxNode>, ParseError> {
    let tree = parse_pooled(unit)?;
    let spec = spec_for(unit.language);
    Ok(collect_level(tree.root_node(), &unit.text, 0, spec))
}

/// Collect boundaries among the named children of `parent`.
fn collect_level(
    parent: tree_sitter::Node,
    content: &str,
    depth: usize,
    spec: &GrammarSpec,
) -> Vec<SyntaxNode> {
    let mut nodes = Vec::new();

    for i in 0..parent.named_child_count() {
        let Some(child) = parent.named_child(i) else {
            continue;
        };
        if child.kind().contains("comment") {
            continue;
        }

        if let Some(node) = classify(child, content, depth, spec) {
            nodes.push(node);
        } else if depth == 0 {
            // Top-level statement outside any declaration (script code);
            // keep it so chunking still covers the whole file.
            nodes.push(make_node(NodeKind::Other, String::new(), child, depth));
        }
    }

    nodes
}

/// Turn one tree-sitter node into a boundary, or None if it is not one.
fn classify(
    node: tree_sitter::Node,
    content: &str,
    depth: usize,
    spec: &GrammarSpec,
) -> Option<SyntaxNode> {
    let kind = node.kind();

    if spec.wrappers.contains(&kind) {
        // Unwrap to the declaration inside, but keep the wrapper's outer
        // extent so export keywords and decorators stay with it.
        for i in 0..node.named_child_count() {
            let inner = node.named_child(i)?;
            if let Some(mut boundary) = classify(inner, content, depth, spec) {
                boundary.start_byte = node.start_byte();
                boundary.start_line = node.start_position().row + 1;
                boundary.end_byte = boundary.end_byte.max(node.end_byte());
                boundary.end_line = boundary.end_line.max(node.end_position().row + 1);
                return Some(boundary);
            }
        }
        return None;
    }

    if spec.functions.contains(&kind) {
        return Some(make_node(
            NodeKind::Function,
            node_name(node, content),
            node,
            depth,
        ));
    }

    if spec.modules.contains(&kind) {
        let mut module = make_node(NodeKind::Module, node_name(node, content), node, depth);
        module.children = collect_members(node, content, depth + 1, spec);
        return Some(module);
    }

    if spec.containers.contains(&kind) {
        let mut container = make_node(NodeKind::Class, node_name(node, content), node, depth);
        container.children = collect_members(node, content, depth + 1, spec);
        return Some(container);
    }

    if spec.types.contains(&kind) {
        return Some(make_node(
            NodeKind::Class,
            node_name(node, content),
            node,
            depth,
        ));
    }

    if spec.imports.contains(&kind) {
        return Some(make_node(NodeKind::Import, String::new(), node, depth));
    }

    None
}

/// Collect member declarations from a container's body field.
fn collect_members(
    node: tree_sitter::Node,
    content: &str,
    depth: usize,
    spec: &GrammarSpec,
) -> Vec<SyntaxNode> {
    match node.child_by_field_name("body") {
        Some(body) => collect_level(body, content, depth, spec),
        None => Vec::new(),
    }
}

fn make_node(kind: NodeKind, name: String, node: tree_sitter::Node, depth: usize) -> SyntaxNode {
    SyntaxNode {
        kind,
        name,
        start_byte: node.start_byte(),
        end_byte: node.end_byte(),
        start_line: node.start_position().row + 1,
        end_line: node.end_position().row + 1,
        depth,
        children: Vec::new(),
    }
}

fn node_name(node: tree_sitter::Node, content: &str) -> String {
    if let Some(name) = node.child_by_field_name("name") {
        return node_text(name, content);
    }
    // Go type/const declarations nest the name one level down
    for i in 0..node.named_child_count() {
        if let Some(child) = node.named_child(i) {
            if let Some(name) = child.child_by_field_name("name") {
                return node_text(name, content);
            }
        }
    }
    String::new()
}

fn node_text(node: tree_sitter::Node, content: &str) -> String {
    content[node.start_byte()..node.end_byte()].to_string()
}
