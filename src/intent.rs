//! Review intents and strategy selection
//!
//! `select_strategy` is a pure lookup: intent and a cheap complexity signal
//! in, chunking strategy out. The signal is computed from raw text without a
//! parse, so selection can run even for units the indexer later rejects.

use crate::chunk::ChunkingStrategy;
use crate::source::{Language, SourceUnit};
use serde::{Deserialize, Serialize};

/// What the caller wants out of the review. Closed enumeration; unknown
/// caller tags map to `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReviewIntent {
    Architectural,
    Security,
    Performance,
    QuickFixes,
    General,
    /// Synthetic intent for the narrative-summary pass; never selected by
    /// callers directly
    Consolidation,
}

impl ReviewIntent {
    /// Map a caller-supplied tag onto an intent. Unknown tags fall back to
    /// `General` rather than erroring.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "architectural" | "architecture" => ReviewIntent::Architectural,
            "security" => ReviewIntent::Security,
            "performance" | "perf" => ReviewIntent::Performance,
            "quick-fixes" | "quickfixes" | "quick_fixes" => ReviewIntent::QuickFixes,
            _ => ReviewIntent::General,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReviewIntent::Architectural => "architectural",
            ReviewIntent::Security => "security",
            ReviewIntent::Performance => "performance",
            ReviewIntent::QuickFixes => "quick-fixes",
            ReviewIntent::General => "general",
            ReviewIntent::Consolidation => "consolidation",
        }
    }
}

/// Cheap per-unit complexity heuristic, computed without a full parse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexitySignal {
    /// Rough count of declaration keywords at low indent
    pub declaration_count: usize,
    /// Average leading-whitespace depth across non-blank lines
    pub avg_nesting: f64,
    /// Unit size in bytes
    pub bytes: usize,
}

impl ComplexitySignal {
    pub fn measure(unit: &SourceUnit) -> Self {
        let mut declaration_count = 0usize;
        let mut indent_total = 0usize;
        let mut indented_lines = 0usize;

        for line in unit.text.lines() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() {
                continue;
            }
            let indent = line.len() - trimmed.len();
            indent_total += indent / 4;
            indented_lines += 1;

            if indent <= 4 && starts_declaration(trimmed, unit.language) {
                declaration_count += 1;
            }
        }

        let avg_nesting = if indented_lines > 0 {
            indent_total as f64 / indented_lines as f64
        } else {
            0.0
        };

        Self {
            declaration_count,
            avg_nesting,
            bytes: unit.bytes(),
        }
    }
}

fn starts_declaration(line: &str, language: Language) -> bool {
    let keywords: &[&str] = match language {
        Language::Rust => &["fn ", "pub fn ", "pub(crate) fn ", "struct ", "pub struct ", "enum ", "pub enum ", "trait ", "pub trait ", "impl ", "mod ", "pub mod "],
        Language::JavaScript | Language::TypeScript => &[
            "function ",
            "export function ",
            "async function ",
            "export async function ",
            "class ",
            "export class ",
            "export default class ",
            "interface ",
            "export interface ",
        ],
        Language::Python => &["def ", "async def ", "class "],
        Language::Go => &["func ", "type "],
        Language::Unknown => &[],
    };
    keywords.iter().any(|k| line.starts_with(k))
}

/// Deterministic intent -> strategy table.
///
/// A unit with no recognizable declarations has nothing for the syntax-aware
/// builders to anchor on, so it goes straight to line windows regardless of
/// intent. Units whose indexing failed are handled by the caller, which
/// overrides the selection to `LineBased`.
pub fn select_strategy(
    intent: ReviewIntent,
    _language: Language,
    signal: &ComplexitySignal,
) -> ChunkingStrategy {
    if signal.declaration_count == 0 {
        return ChunkingStrategy::LineBased;
    }

    match intent {
        ReviewIntent::Architectural => ChunkingStrategy::Hierarchical,
        ReviewIntent::Security => ChunkingStrategy::Contextual,
        ReviewIntent::Performance => ChunkingStrategy::Functional,
        ReviewIntent::QuickFixes => ChunkingStrategy::Individual,
        ReviewIntent::General | ReviewIntent::Consolidation => ChunkingStrategy::Grouped,
    }
}
