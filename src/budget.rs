//! Token budgets and pass planning
//!
//! Estimation is deterministic and model-free: the default estimator is a
//! character-count heuristic, pluggable behind `TokenEstimator` for callers
//! with a real tokenizer. Planning is greedy bin-packing with a merge pass
//! that minimizes total pass count, which directly reduces downstream API
//! call volume. Planning runs single-threaded, before any pass executes.

use crate::chunk::{Chunk, ChunkId, ChunkingStrategy, Span};
use crate::config::ModelConfig;
use crate::error::PlanningError;
use crate::source::SourceSet;
use tracing::debug;

/// Deterministic token estimation for a piece of text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Character-count estimator: chars / chars_per_token, rounded up.
/// Close enough for packing; the reserved overhead absorbs the error.
#[derive(Debug, Clone, Copy)]
pub struct CharEstimator {
    pub chars_per_token: f32,
}

impl Default for CharEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
        }
    }
}

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> u32 {
        let chars = text.chars().count() as f32;
        (chars / self.chars_per_token).ceil() as u32
    }
}

/// Per-call token allowance: context window minus reserved overhead.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    pub context_window: u32,
    pub reserved: u32,
}

impl TokenBudget {
    pub fn from_model(config: &ModelConfig) -> Self {
        Self {
            context_window: config.context_window,
            reserved: config.reserved_tokens,
        }
    }

    /// Tokens available for chunk content in one pass.
    pub fn capacity(&self) -> u32 {
        self.context_window.saturating_sub(self.reserved)
    }
}

/// A planned pass: which chunks ride together and what they cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPass {
    pub chunk_ids: Vec<ChunkId>,
    pub estimated_tokens: u32,
}

/// Re-split any chunk whose estimate alone exceeds the full pass capacity;
/// oversized chunks are never submitted.
///
/// Multi-span chunks split between spans (boundaries preserved); single-span
/// chunks split by lines and are retagged `LineBased`, since the cut may
/// cross a declaration. Fails only when even a single line will not fit.
pub fn split_oversized(
    chunks: Vec<Chunk>,
    budget: &TokenBudget,
    estimator: &dyn TokenEstimator,
    sources: &SourceSet,
) -> Result<Vec<Chunk>, PlanningError> {
    let capacity = budget.capacity();
    if capacity == 0 {
        return Err(PlanningError::EmptyBudget {
            window: budget.context_window,
            reserved: budget.reserved,
        });
    }

    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.estimated_tokens <= capacity {
            out.push(chunk);
            continue;
        }
        debug!(
            chunk = %chunk.id,
            tokens = chunk.estimated_tokens,
            capacity,
            "re-splitting oversized chunk"
        );
        split_chunk(&chunk, capacity, estimator, sources, &mut out)?;
    }
    Ok(out)
}

fn split_chunk(
    chunk: &Chunk,
    capacity: u32,
    estimator: &dyn TokenEstimator,
    sources: &SourceSet,
    out: &mut Vec<Chunk>,
) -> Result<(), PlanningError> {
    if chunk.spans.len() > 1 {
        // Split between spans: declaration boundaries survive.
        let mid = chunk.spans.len() / 2;
        for (part, spans) in [&chunk.spans[..mid], &chunk.spans[mid..]].iter().enumerate() {
            let sub = derived_chunk(chunk, part, spans.to_vec(), chunk.strategy, estimator, sources);
            if sub.estimated_tokens > capacity {
                split_chunk(&sub, capacity, estimator, sources, out)?;
            } else {
                out.push(sub);
            }
        }
        return Ok(());
    }

    // Single span: cut by lines; the result is no longer syntax-aware.
    let span = chunk.spans.first().ok_or(PlanningError::NoChunks)?;
    let unit = sources
        .get(&span.path)
        .ok_or_else(|| PlanningError::UnsplittableChunk {
            chunk_id: chunk.id.clone(),
        })?;

    let text = &unit.text[span.start_byte..span.end_byte.min(unit.text.len())];

    // (start_byte, end_byte, line, cost); the slice excludes the newline but
    // the cost includes it, matching what the sub-chunk estimate will see
    let mut records: Vec<(usize, usize, usize, u32)> = Vec::new();
    let mut offset = span.start_byte;
    let mut line = span.start_line;
    for raw in text.split_inclusive('\n') {
        let content = raw.strip_suffix('\n').unwrap_or(raw);
        let cost = estimator.estimate(raw).max(1);
        records.push((offset, offset + content.len(), line, cost));
        offset += raw.len();
        line += 1;
    }

    let mut part = 0usize;
    let mut i = 0usize;
    while i < records.len() {
        let mut take = 0usize;
        let mut used = 0u32;
        while i + take < records.len() {
            let cost = records[i + take].3;
            if take > 0 && used.saturating_add(cost) > capacity {
                break;
            }
            used = used.saturating_add(cost);
            take += 1;
        }

        // Per-line pricing only approximates the real sub-chunk estimate
        // (inherited context spans, trailing newline); check each candidate
        // against capacity and shed lines until it fits.
        loop {
            let first = records[i];
            let last = records[i + take - 1];
            let sub_span = Span {
                path: span.path.clone(),
                start_byte: first.0,
                end_byte: last.1,
                start_line: first.2,
                end_line: last.2,
            };
            let sub = derived_chunk(
                chunk,
                part,
                vec![sub_span],
                ChunkingStrategy::LineBased,
                estimator,
                sources,
            );
            if sub.estimated_tokens <= capacity {
                out.push(sub);
                part += 1;
                i += take;
                break;
            }
            if take == 1 {
                return Err(PlanningError::UnsplittableChunk {
                    chunk_id: chunk.id.clone(),
                });
            }
            take -= 1;
        }
    }

    Ok(())
}

fn derived_chunk(
    parent: &Chunk,
    part: usize,
    spans: Vec<Span>,
    strategy: ChunkingStrategy,
    estimator: &dyn TokenEstimator,
    sources: &SourceSet,
) -> Chunk {
    let mut chunk = Chunk {
        id: ChunkId::new(
            std::path::Path::new(&format!("{}/s{}", parent.id, part)),
            strategy.tag(),
            part,
        ),
        spans,
        context_spans: parent.context_spans.clone(),
        strategy,
        estimated_tokens: 0,
    };
    chunk.estimated_tokens = estimator.estimate(&chunk.raw_text(sources));
    chunk
}

/// Greedy bin-packing: descending sizes, first-fit, then merge passes whose
/// combined size still fits one budget, smallest first.
///
/// `max_chunks_per_pass` caps fan-in even when the token budget allows more.
/// Expects oversized chunks to have been re-split already.
pub fn plan(
    chunks: &[Chunk],
    budget: &TokenBudget,
    max_chunks_per_pass: usize,
) -> Result<Vec<PlannedPass>, PlanningError> {
    let capacity = budget.capacity();
    if capacity == 0 {
        return Err(PlanningError::EmptyBudget {
            window: budget.context_window,
            reserved: budget.reserved,
        });
    }
    if chunks.is_empty() {
        return Err(PlanningError::NoChunks);
    }
    let max_chunks = max_chunks_per_pass.max(1);

    if let Some(oversized) = chunks.iter().find(|c| c.estimated_tokens > capacity) {
        return Err(PlanningError::UnsplittableChunk {
            chunk_id: oversized.id.clone(),
        });
    }

    // Descending size, original position as deterministic tie-break.
    let mut order: Vec<usize> = (0..chunks.len()).collect();
    order.sort_by(|&a, &b| {
        chunks[b]
            .estimated_tokens
            .cmp(&chunks[a].estimated_tokens)
            .then(a.cmp(&b))
    });

    // The planning ledger: one (members, consumed) entry per open pass.
    let mut bins: Vec<(Vec<usize>, u32)> = Vec::new();
    for idx in order {
        let cost = chunks[idx].estimated_tokens;
        let slot = bins
            .iter()
            .position(|(members, consumed)| members.len() < max_chunks && consumed + cost <= capacity);
        match slot {
            Some(b) => {
                bins[b].0.push(idx);
                bins[b].1 += cost;
            }
            None => bins.push((vec![idx], cost)),
        }
    }

    merge_bins(&mut bins, capacity, max_chunks);

    // Deterministic pass order: by earliest chunk position, chunks in file
    // order within a pass.
    for (members, _) in bins.iter_mut() {
        members.sort_unstable();
    }
    bins.sort_by_key(|(members, _)| members.first().copied().unwrap_or(usize::MAX));

    debug!(passes = bins.len(), chunks = chunks.len(), "pass plan ready");

    Ok(bins
        .into_iter()
        .map(|(members, consumed)| PlannedPass {
            chunk_ids: members.iter().map(|&i| chunks[i].id.clone()).collect(),
            estimated_tokens: consumed,
        })
        .collect())
}

/// Merge passes whose combined size fits one budget, iterating from the
/// smallest pair up, to minimize total pass count.
fn merge_bins(bins: &mut Vec<(Vec<usize>, u32)>, capacity: u32, max_chunks: usize) {
    loop {
        bins.sort_by_key(|(_, consumed)| *consumed);

        let mut merged = None;
        'outer: for i in 0..bins.len() {
            for j in (i + 1)..bins.len() {
                let fits_tokens = bins[i].1 + bins[j].1 <= capacity;
                let fits_count = bins[i].0.len() + bins[j].0.len() <= max_chunks;
                if fits_tokens && fits_count {
                    merged = Some((i, j));
                    break 'outer;
                }
            }
        }

        match merged {
            Some((i, j)) => {
                let (members, consumed) = bins.remove(j);
                bins[i].0.extend(members);
                bins[i].1 += consumed;
            }
            None => break,
        }
    }
}
