//! One pure builder per chunking strategy
//!
//! Syntax-aware builders work over declaration boundaries and never bisect
//! one: a declaration that straddles a size boundary stays whole in the
//! earlier group. Fallback builders (line windows, whole file, emergency)
//! ignore syntax entirely.

use super::{Chunk, ChunkId, ChunkingStrategy, Span};
use crate::budget::TokenEstimator;
use crate::index::{SyntaxIndex, SyntaxNode};
use crate::source::{SourceSet, SourceUnit};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

/// One chunk per top-level declaration. Best for quick-fixes intent, where
/// each issue should map to one focused unit.
pub fn individual(
    unit: &SourceUnit,
    index: &SyntaxIndex,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    index
        .declarations()
        .enumerate()
        .map(|(ordinal, node)| {
            make_chunk(
                unit,
                ChunkingStrategy::Individual,
                ordinal,
                vec![node_span(unit, node, node)],
                Vec::new(),
                estimator,
            )
        })
        .collect()
}

/// Merge small declarations up to a target size, preserving file order.
pub fn grouped(
    unit: &SourceUnit,
    index: &SyntaxIndex,
    target_tokens: u32,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    let decls: Vec<&SyntaxNode> = index.declarations().collect();
    accumulate(
        unit,
        &decls,
        target_tokens,
        ChunkingStrategy::Grouped,
        Vec::new(),
        estimator,
    )
}

/// Keep each class/module with all its members in one chunk, even when that
/// chunk runs larger than average; loose declarations accumulate like
/// `grouped`.
pub fn hierarchical(
    unit: &SourceUnit,
    index: &SyntaxIndex,
    target_tokens: u32,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut ordinal = 0usize;
    let mut pending: Vec<&SyntaxNode> = Vec::new();
    let mut pending_tokens = 0u32;

    let mut flush = |pending: &mut Vec<&SyntaxNode>, pending_tokens: &mut u32, chunks: &mut Vec<Chunk>, ordinal: &mut usize| {
        if pending.is_empty() {
            return;
        }
        let spans = coalesce_run(unit, pending);
        chunks.push(make_chunk(
            unit,
            ChunkingStrategy::Hierarchical,
            *ordinal,
            spans,
            Vec::new(),
            estimator,
        ));
        *ordinal += 1;
        pending.clear();
        *pending_tokens = 0;
    };

    for node in index.declarations() {
        if !node.children.is_empty() {
            flush(&mut pending, &mut pending_tokens, &mut chunks, &mut ordinal);
            chunks.push(make_chunk(
                unit,
                ChunkingStrategy::Hierarchical,
                ordinal,
                vec![node_span(unit, node, node)],
                Vec::new(),
                estimator,
            ));
            ordinal += 1;
            continue;
        }

        pending_tokens += estimator.estimate(node_text(unit, node));
        pending.push(node);
        if pending_tokens >= target_tokens {
            flush(&mut pending, &mut pending_tokens, &mut chunks, &mut ordinal);
        }
    }
    flush(&mut pending, &mut pending_tokens, &mut chunks, &mut ordinal);

    chunks
}

/// Group declarations by call-graph adjacency within the file, approximated
/// by identifier co-occurrence rather than full data flow.
pub fn functional(
    unit: &SourceUnit,
    index: &SyntaxIndex,
    group_max: usize,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    let decls: Vec<&SyntaxNode> = index.declarations().collect();
    if decls.is_empty() {
        return Vec::new();
    }

    let idents: Vec<HashSet<String>> = decls
        .iter()
        .map(|node| identifiers(node_text(unit, node)))
        .collect();

    // Greedy union in file order: join the earliest group with an adjacent
    // member, else open a new one.
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for (i, node) in decls.iter().enumerate() {
        let adjacent = |j: usize| -> bool {
            let other = decls[j];
            (!other.name.is_empty() && idents[i].contains(&other.name))
                || (!node.name.is_empty() && idents[j].contains(&node.name))
        };

        let slot = groups
            .iter()
            .position(|members| members.len() < group_max.max(1) && members.iter().any(|&j| adjacent(j)));
        match slot {
            Some(g) => groups[g].push(i),
            None => groups.push(vec![i]),
        }
    }

    groups
        .iter()
        .enumerate()
        .map(|(ordinal, members)| {
            let nodes: Vec<&SyntaxNode> = members.iter().map(|&i| decls[i]).collect();
            let spans = coalesce_indexed(unit, members, &nodes);
            make_chunk(
                unit,
                ChunkingStrategy::Functional,
                ordinal,
                spans,
                Vec::new(),
                estimator,
            )
        })
        .collect()
}

/// Like `grouped`, but the unit's import block is duplicated into every
/// chunk as read-only prefix context, giving each pass dependency
/// visibility.
pub fn contextual(
    unit: &SourceUnit,
    index: &SyntaxIndex,
    target_tokens: u32,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    let context = index
        .import_block()
        .map(|block| Span {
            path: unit.path.clone(),
            start_byte: block.start_byte,
            end_byte: block.end_byte,
            start_line: block.start_line,
            end_line: block.end_line,
        })
        .into_iter()
        .collect::<Vec<_>>();

    let decls: Vec<&SyntaxNode> = index.declarations().collect();
    accumulate(
        unit,
        &decls,
        target_tokens,
        ChunkingStrategy::Contextual,
        context,
        estimator,
    )
}

/// Fixed-size line windows with a small overlap; syntax is ignored.
pub fn line_based(
    unit: &SourceUnit,
    window: usize,
    overlap: usize,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    let lines = line_ranges(&unit.text);
    if lines.is_empty() {
        return Vec::new();
    }

    let window = window.max(1);
    let step = window.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut ordinal = 0usize;

    loop {
        let end = (start + window).min(lines.len());
        let span = Span {
            path: unit.path.clone(),
            start_byte: lines[start].0,
            end_byte: lines[end - 1].1,
            start_line: start + 1,
            end_line: end,
        };
        chunks.push(make_chunk(
            unit,
            ChunkingStrategy::LineBased,
            ordinal,
            vec![span],
            Vec::new(),
            estimator,
        ));
        ordinal += 1;

        if end == lines.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// One chunk covering the entire unit, regardless of size. Oversize is the
/// planner's problem (re-split) at this tier.
pub fn whole_file(unit: &SourceUnit, estimator: &dyn TokenEstimator) -> Vec<Chunk> {
    let line_count = unit.line_count();
    if line_count == 0 {
        return Vec::new();
    }
    let span = Span {
        path: unit.path.clone(),
        start_byte: 0,
        end_byte: unit.text.len(),
        start_line: 1,
        end_line: line_count,
    };
    vec![make_chunk(
        unit,
        ChunkingStrategy::WholeFile,
        0,
        vec![span],
        Vec::new(),
        estimator,
    )]
}

/// Emergency chunk: heavily truncated head of every unit, sized to fit one
/// pass budget. Never fails; an empty source set yields an empty chunk.
pub fn emergency(
    sources: &SourceSet,
    capacity_tokens: u32,
    estimator: &dyn TokenEstimator,
) -> Chunk {
    let share = capacity_tokens / sources.len().max(1) as u32;
    let mut spans = Vec::new();

    for unit in sources.units() {
        let lines = line_ranges(&unit.text);
        if lines.is_empty() {
            continue;
        }

        let mut end = 0usize;
        let mut used = 0u32;
        for (i, &(start_byte, end_byte)) in lines.iter().enumerate() {
            let cost = estimator.estimate(&unit.text[start_byte..end_byte]).max(1);
            if i > 0 && used + cost > share {
                break;
            }
            used += cost;
            end = i + 1;
        }

        spans.push(Span {
            path: unit.path.clone(),
            start_byte: lines[0].0,
            end_byte: lines[end - 1].1,
            start_line: 1,
            end_line: end,
        });
    }

    let estimated_tokens = spans
        .iter()
        .map(|span| {
            sources
                .get(&span.path)
                .map(|u| estimator.estimate(&u.text[span.start_byte..span.end_byte]))
                .unwrap_or(0)
        })
        .sum();

    Chunk {
        id: ChunkId::new(Path::new("<emergency>"), ChunkingStrategy::SingleUnit.tag(), 0),
        spans,
        context_spans: Vec::new(),
        strategy: ChunkingStrategy::SingleUnit,
        estimated_tokens,
    }
}

// ───────────────────────────────────────────────────────────────────────────
// helpers

/// Accumulate declarations in file order up to a target size. A declaration
/// that crosses the target stays whole in the group it started in.
fn accumulate(
    unit: &SourceUnit,
    decls: &[&SyntaxNode],
    target_tokens: u32,
    strategy: ChunkingStrategy,
    context: Vec<Span>,
    estimator: &dyn TokenEstimator,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut pending: Vec<&SyntaxNode> = Vec::new();
    let mut pending_tokens = 0u32;
    let mut ordinal = 0usize;

    for node in decls {
        pending_tokens += estimator.estimate(node_text(unit, node));
        pending.push(node);
        if pending_tokens >= target_tokens {
            let spans = coalesce_run(unit, &pending);
            chunks.push(make_chunk(
                unit,
                strategy,
                ordinal,
                spans,
                context.clone(),
                estimator,
            ));
            ordinal += 1;
            pending.clear();
            pending_tokens = 0;
        }
    }

    if !pending.is_empty() {
        let spans = coalesce_run(unit, &pending);
        chunks.push(make_chunk(unit, strategy, ordinal, spans, context, estimator));
    }

    chunks
}

fn make_chunk(
    unit: &SourceUnit,
    strategy: ChunkingStrategy,
    ordinal: usize,
    spans: Vec<Span>,
    context_spans: Vec<Span>,
    estimator: &dyn TokenEstimator,
) -> Chunk {
    let estimated_tokens = spans
        .iter()
        .chain(context_spans.iter())
        .map(|span| estimator.estimate(&unit.text[span.start_byte..span.end_byte.min(unit.text.len())]))
        .sum();

    Chunk {
        id: ChunkId::new(&unit.path, strategy.tag(), ordinal),
        spans,
        context_spans,
        strategy,
        estimated_tokens,
    }
}

fn node_text<'a>(unit: &'a SourceUnit, node: &SyntaxNode) -> &'a str {
    &unit.text[node.start_byte..node.end_byte.min(unit.text.len())]
}

fn node_span(unit: &SourceUnit, first: &SyntaxNode, last: &SyntaxNode) -> Span {
    Span {
        path: unit.path.clone(),
        start_byte: first.start_byte,
        end_byte: last.end_byte,
        start_line: first.start_line,
        end_line: last.end_line,
    }
}

/// One span covering a run of declarations that are consecutive in the file;
/// the in-between text (comments, whitespace) rides along.
fn coalesce_run(unit: &SourceUnit, nodes: &[&SyntaxNode]) -> Vec<Span> {
    match (nodes.first(), nodes.last()) {
        (Some(first), Some(last)) => vec![node_span(unit, first, last)],
        _ => Vec::new(),
    }
}

/// Coalesce possibly non-consecutive declarations: runs of consecutive file
/// positions merge into single spans, gaps start a new span.
fn coalesce_indexed(unit: &SourceUnit, positions: &[usize], nodes: &[&SyntaxNode]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut run_start = 0usize;

    for i in 1..=positions.len() {
        let run_ends = i == positions.len() || positions[i] != positions[i - 1] + 1;
        if run_ends {
            spans.push(node_span(unit, nodes[run_start], nodes[i - 1]));
            run_start = i;
        }
    }

    spans
}

/// (start_byte, end_byte) per line, newline excluded.
fn line_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0usize;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            ranges.push((start, i));
            start = i + 1;
        }
    }
    if start < text.len() {
        ranges.push((start, text.len()));
    }
    ranges
}

fn ident_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]{2,}").expect("valid identifier regex"))
}

const IDENT_STOPWORDS: &[&str] = &[
    "let", "mut", "pub", "use", "self", "crate", "impl", "struct", "enum", "trait", "match",
    "return", "const", "static", "async", "await", "function", "class", "import", "export",
    "default", "interface", "type", "var", "new", "this", "def", "pass", "None", "True", "False",
    "func", "package", "string", "int", "bool", "nil", "println", "print", "for", "while", "else",
];

/// Identifier-shaped tokens in a declaration body, stopwords removed.
fn identifiers(text: &str) -> HashSet<String> {
    ident_regex()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|s| !IDENT_STOPWORDS.contains(&s.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CharEstimator;
    use crate::index::index_unit;

    fn estimator() -> CharEstimator {
        CharEstimator::default()
    }

    fn many_fn_unit(count: usize) -> (SourceUnit, SyntaxIndex) {
        let mut text = String::new();
        for i in 0..count {
            text.push_str(&format!("fn f{}() {{\n    let v = {};\n}}\n\n", i, i));
        }
        let unit = SourceUnit::new("many.rs", text);
        let index = index_unit(&unit).unwrap();
        (unit, index)
    }

    #[test]
    fn test_individual_one_chunk_per_declaration() {
        let (unit, index) = many_fn_unit(40);
        let chunks = individual(&unit, &index, &estimator());
        assert_eq!(chunks.len(), 40);
        assert!(chunks.iter().all(|c| c.spans.len() == 1));
    }

    #[test]
    fn test_no_declaration_is_bisected() {
        let (unit, index) = many_fn_unit(12);
        for chunks in [
            grouped(&unit, &index, 50, &estimator()),
            hierarchical(&unit, &index, 50, &estimator()),
            functional(&unit, &index, 4, &estimator()),
            contextual(&unit, &index, 50, &estimator()),
        ] {
            for node in index.declarations() {
                let holders: Vec<_> = chunks
                    .iter()
                    .filter(|c| {
                        c.spans.iter().any(|s| {
                            s.start_byte <= node.start_byte && node.end_byte <= s.end_byte
                        })
                    })
                    .collect();
                assert_eq!(
                    holders.len(),
                    1,
                    "declaration {} must live in exactly one chunk",
                    node.name
                );
            }
        }
    }

    #[test]
    fn test_grouped_respects_file_order_and_target() {
        let (unit, index) = many_fn_unit(10);
        let chunks = grouped(&unit, &index, 20, &estimator());
        assert!(chunks.len() > 1);
        // spans ordered by file position across chunks
        let starts: Vec<usize> = chunks.iter().map(|c| c.spans[0].start_byte).collect();
        let mut sorted = starts.clone();
        sorted.sort_unstable();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn test_hierarchical_keeps_container_whole() {
        let text = "struct S;\n\nimpl S {\n    fn a(&self) {}\n    fn b(&self) {}\n    fn c(&self) {}\n}\n\nfn loose() {}\n";
        let unit = SourceUnit::new("h.rs", text);
        let index = index_unit(&unit).unwrap();
        let chunks = hierarchical(&unit, &index, 5, &estimator());

        let container = chunks
            .iter()
            .find(|c| {
                c.spans
                    .iter()
                    .any(|s| unit.text[s.start_byte..s.end_byte].starts_with("impl S"))
            })
            .expect("container chunk");
        assert_eq!(container.spans.len(), 1);
        assert!(unit.text[container.spans[0].start_byte..container.spans[0].end_byte].contains("fn c"));
    }

    #[test]
    fn test_functional_groups_by_call_adjacency() {
        let text = "fn fetch_user() {\n    parse_user();\n}\n\nfn parse_user() {\n    let x = 1;\n}\n\nfn unrelated_job() {\n    let y = 2;\n}\n";
        let unit = SourceUnit::new("f.rs", text);
        let index = index_unit(&unit).unwrap();
        let chunks = functional(&unit, &index, 8, &estimator());

        assert_eq!(chunks.len(), 2);
        let first = &chunks[0];
        let joined: String = first
            .spans
            .iter()
            .map(|s| &unit.text[s.start_byte..s.end_byte])
            .collect();
        assert!(joined.contains("fetch_user") && joined.contains("parse_user"));
    }

    #[test]
    fn test_contextual_duplicates_import_block() {
        let text = "use std::io;\nuse std::fmt;\n\nfn a() {\n    let x = 1;\n}\n\nfn b() {\n    let y = 2;\n}\n";
        let unit = SourceUnit::new("c.rs", text);
        let index = index_unit(&unit).unwrap();
        let chunks = contextual(&unit, &index, 10, &estimator());

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.context_spans.len(), 1);
            assert_eq!(chunk.context_spans[0].start_line, 1);
        }
    }

    #[test]
    fn test_line_based_windows_cover_all_lines() {
        let text: String = (0..300).map(|i| format!("line {}\n", i)).collect();
        let unit = SourceUnit::new("big.py", text);
        let chunks = line_based(&unit, 120, 10, &estimator());

        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].spans[0].start_line, 1);
        assert_eq!(chunks.last().unwrap().spans[0].end_line, 300);
        // consecutive windows overlap
        assert!(chunks[1].spans[0].start_line <= chunks[0].spans[0].end_line);
    }

    #[test]
    fn test_whole_file_single_chunk() {
        let unit = SourceUnit::new("w.go", "package w\n\nfunc A() {}\n");
        let chunks = whole_file(&unit, &estimator());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].spans[0].start_line, 1);
        assert_eq!(chunks[0].spans[0].end_line, unit.line_count());
    }

    #[test]
    fn test_emergency_fits_capacity() {
        let sources = SourceSet::new(vec![
            SourceUnit::new("a.rs", "fn a() {}\n".repeat(200)),
            SourceUnit::new("b.rs", "fn b() {}\n".repeat(200)),
        ]);
        let chunk = emergency(&sources, 100, &estimator());
        assert_eq!(chunk.spans.len(), 2);
        assert!(chunk.estimated_tokens <= 120, "heavy truncation expected");
        assert!(chunk.spans.iter().all(|s| s.start_line == 1));
    }
}
