//! Chunks: bounded, reviewable slices of source text
//!
//! A chunk is an ordered list of non-overlapping spans over one source unit
//! (plus optional read-only context spans, which may repeat across chunks).
//! Chunks are immutable once built; the pass scheduler consumes them and the
//! consolidation engine maps model-reported chunk-local lines back through
//! their span tables.

pub mod strategies;

use crate::budget::TokenEstimator;
use crate::config::EngineConfig;
use crate::index::SyntaxIndex;
use crate::source::{SourceSet, SourceUnit};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// How a chunk was produced. Closed set; the first five are syntax-aware,
/// the last three are fallback-tier strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkingStrategy {
    Individual,
    Grouped,
    Hierarchical,
    Functional,
    Contextual,
    LineBased,
    WholeFile,
    SingleUnit,
}

impl ChunkingStrategy {
    pub fn tag(&self) -> &'static str {
        match self {
            ChunkingStrategy::Individual => "individual",
            ChunkingStrategy::Grouped => "grouped",
            ChunkingStrategy::Hierarchical => "hierarchical",
            ChunkingStrategy::Functional => "functional",
            ChunkingStrategy::Contextual => "contextual",
            ChunkingStrategy::LineBased => "line-based",
            ChunkingStrategy::WholeFile => "whole-file",
            ChunkingStrategy::SingleUnit => "single-unit",
        }
    }

    pub fn is_syntax_aware(&self) -> bool {
        matches!(
            self,
            ChunkingStrategy::Individual
                | ChunkingStrategy::Grouped
                | ChunkingStrategy::Hierarchical
                | ChunkingStrategy::Functional
                | ChunkingStrategy::Contextual
        )
    }
}

/// Stable chunk identifier: deterministic for identical input and strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(path: &Path, tag: &str, ordinal: usize) -> Self {
        Self(format!("{}#{}:{}", path.display(), tag, ordinal))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous byte/line range within one source unit.
/// Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub path: PathBuf,
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
}

impl Span {
    pub fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.path == other.path
            && self.start_byte < other.end_byte
            && other.start_byte < self.end_byte
    }
}

/// One reviewable unit of text. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// Primary spans, in file order, never overlapping
    pub spans: Vec<Span>,
    /// Read-only prefix context (e.g. the unit's import block); may be
    /// duplicated across chunks of the same unit
    pub context_spans: Vec<Span>,
    pub strategy: ChunkingStrategy,
    pub estimated_tokens: u32,
}

impl Chunk {
    /// Total primary line count (context excluded); this is the local line
    /// space the model reports findings against.
    pub fn primary_line_count(&self) -> usize {
        self.spans.iter().map(Span::line_count).sum()
    }

    /// Map a chunk-local line (1-based, counted across primary spans) back
    /// to its file and absolute line.
    pub fn absolute_line(&self, local: usize) -> Option<(&Path, usize)> {
        if local == 0 {
            return None;
        }
        let mut consumed = 0usize;
        for span in &self.spans {
            let lines = span.line_count();
            if local <= consumed + lines {
                return Some((span.path.as_path(), span.start_line + (local - consumed - 1)));
            }
            consumed += lines;
        }
        None
    }

    /// Concatenated raw text of context and primary spans, used for token
    /// estimation.
    pub fn raw_text(&self, sources: &SourceSet) -> String {
        let mut out = String::new();
        for span in self.context_spans.iter().chain(self.spans.iter()) {
            if let Some(unit) = sources.get(&span.path) {
                out.push_str(&unit.text[span.start_byte..span.end_byte.min(unit.text.len())]);
                out.push('\n');
            }
        }
        out
    }

    /// Render the chunk for a prompt: context first, unnumbered, then
    /// primary spans with continuous chunk-local line numbers.
    pub fn render(&self, sources: &SourceSet) -> String {
        let mut out = String::new();

        for span in &self.context_spans {
            let Some(unit) = sources.get(&span.path) else {
                continue;
            };
            out.push_str(&format!(
                "--- context from {} (read-only) ---\n",
                span.path.display()
            ));
            out.push_str(&unit.text[span.start_byte..span.end_byte.min(unit.text.len())]);
            out.push('\n');
        }

        let mut local = 0usize;
        for span in &self.spans {
            let Some(unit) = sources.get(&span.path) else {
                continue;
            };
            out.push_str(&format!(
                "=== {} (lines {}-{}) ===\n",
                span.path.display(),
                span.start_line,
                span.end_line
            ));
            let text = &unit.text[span.start_byte..span.end_byte.min(unit.text.len())];
            for line in text.lines() {
                local += 1;
                out.push_str(&format!("{:4}| {}\n", local, line));
            }
        }

        out
    }

    /// The unit this chunk primarily covers.
    pub fn primary_path(&self) -> Option<&Path> {
        self.spans.first().map(|s| s.path.as_path())
    }
}

/// Build chunks for one unit under the given strategy.
///
/// Syntax-aware strategies need an index; when none is available the unit
/// degrades to line windows, mirroring the selector's override for parse
/// failures.
pub fn build_chunks(
    unit: &SourceUnit,
    index: Option<&SyntaxIndex>,
    strategy: ChunkingStrategy,
    config: &EngineConfig,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    if strategy.is_syntax_aware() {
        let Some(index) = index else {
            return strategies::line_based(unit, config.line_window, config.line_overlap, estimator);
        };
        return match strategy {
            ChunkingStrategy::Individual => strategies::individual(unit, index, estimator),
            ChunkingStrategy::Grouped => {
                strategies::grouped(unit, index, config.grouped_target_tokens, estimator)
            }
            ChunkingStrategy::Hierarchical => {
                strategies::hierarchical(unit, index, config.grouped_target_tokens, estimator)
            }
            ChunkingStrategy::Functional => {
                strategies::functional(unit, index, config.functional_group_max, estimator)
            }
            ChunkingStrategy::Contextual => {
                strategies::contextual(unit, index, config.grouped_target_tokens, estimator)
            }
            _ => Vec::new(),
        };
    }

    match strategy {
        ChunkingStrategy::LineBased => {
            strategies::line_based(unit, config.line_window, config.line_overlap, estimator)
        }
        _ => strategies::whole_file(unit, estimator),
    }
}
