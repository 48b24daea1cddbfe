//! Syntax indexer
//!
//! Uses tree-sitter for multi-language AST parsing and reduces each source
//! unit to its declaration-level boundaries: functions, classes, modules and
//! imports, with byte and line ranges. Chunk builders work over these
//! boundaries; nothing downstream ever sees a raw tree-sitter tree.

pub mod parser;

use crate::error::ParseError;
use crate::source::{Language, SourceSet, SourceUnit};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Kind of a declaration boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Function,
    Class,
    Module,
    Import,
    Other,
}

/// One parsed declaration boundary. Produced once per unit, never mutated.
///
/// Lines are 1-based and inclusive; byte offsets index into the unit's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntaxNode {
    pub kind: NodeKind,
    pub name: String,
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub depth: usize,
    pub children: Vec<SyntaxNode>,
}

impl SyntaxNode {
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    pub fn byte_len(&self) -> usize {
        self.end_byte.saturating_sub(self.start_byte)
    }

    /// Count of nodes in this subtree, self included.
    pub fn subtree_size(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(SyntaxNode::subtree_size)
            .sum::<usize>()
    }
}

/// Declaration boundaries for one source unit, in file order.
#[derive(Debug, Clone)]
pub struct SyntaxIndex {
    pub path: PathBuf,
    pub language: Language,
    /// Top-level nodes in file order, imports included
    pub nodes: Vec<SyntaxNode>,
}

impl SyntaxIndex {
    /// Top-level declarations, imports excluded.
    pub fn declarations(&self) -> impl Iterator<Item = &SyntaxNode> {
        self.nodes.iter().filter(|n| n.kind != NodeKind::Import)
    }

    pub fn declaration_count(&self) -> usize {
        self.declarations().count()
    }

    /// The leading import block: the run of import nodes before the first
    /// declaration, merged into one (bytes, lines) range. Used by the
    /// contextual strategy as read-only prefix context.
    pub fn import_block(&self) -> Option<ImportBlock> {
        let mut block: Option<ImportBlock> = None;
        for node in &self.nodes {
            if node.kind != NodeKind::Import {
                break;
            }
            let b = block.get_or_insert(ImportBlock {
                start_byte: node.start_byte,
                end_byte: node.end_byte,
                start_line: node.start_line,
                end_line: node.end_line,
            });
            b.end_byte = b.end_byte.max(node.end_byte);
            b.end_line = b.end_line.max(node.end_line);
        }
        block
    }
}

/// Merged span of a unit's leading imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportBlock {
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
}

/// Index one source unit into declaration boundaries.
///
/// Fails with `ParseError` for unsupported languages or parser faults; the
/// caller demotes that unit to line-based chunking and carries on.
pub fn index_unit(unit: &SourceUnit) -> Result<SyntaxIndex, ParseError> {
    let nodes = parser::extract_boundaries(unit)?;
    Ok(SyntaxIndex {
        path: unit.path.clone(),
        language: unit.language,
        nodes,
    })
}

/// Index many units in parallel, preserving unit order in the result.
/// Per-unit errors are kept alongside successes so the caller can decide
/// how many failures warrant a tier demotion.
pub fn index_units(sources: &SourceSet) -> Vec<(PathBuf, Result<SyntaxIndex, ParseError>)> {
    sources
        .units()
        .par_iter()
        .map(|unit| (unit.path.clone(), index_unit(unit)))
        .collect()
}
