//! Consolidation engine
//!
//! Folds resolved passes into one report: findings parsed from each
//! successful response, chunk-local lines mapped back to absolute file
//! lines, near-duplicates merged, failed passes surfaced as coverage gaps.
//! Consolidation is pure over its inputs; identical pass results always
//! produce the identical report.

mod parse;

use crate::cascade::Tier;
use crate::chunk::{Chunk, ChunkId};
use crate::intent::ReviewIntent;
use crate::schedule::{PassOutcome, ReviewPass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

pub(crate) use parse::{parse_findings, parse_severity};

/// Finding severity, totally ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Nitpick,
    Suggestion,
    Warning,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Nitpick => "nitpick",
            Severity::Suggestion => "suggestion",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// One consolidated finding with absolute file coordinates. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Chunks that reported this finding (grows when duplicates merge)
    pub chunk_ids: Vec<ChunkId>,
    pub file: PathBuf,
    pub start_line: usize,
    pub end_line: usize,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub fingerprint: String,
}

/// A region of the input that received no successful review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageGap {
    pub pass_index: usize,
    pub chunk_ids: Vec<ChunkId>,
    pub reason: String,
}

/// The final report handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedReview {
    pub run_id: Uuid,
    pub intent: ReviewIntent,
    /// Tier the run finished at
    pub tier: Tier,
    /// Every tier entered, in order
    pub tier_history: Vec<Tier>,
    /// True when any fallback below the semantic tier was taken
    pub degraded: bool,
    pub findings: Vec<Finding>,
    pub summary: String,
    /// False when the summary came from the deterministic template
    pub summary_from_model: bool,
    pub coverage_gaps: Vec<CoverageGap>,
    pub files_reviewed: Vec<PathBuf>,
    pub total_estimated_tokens: u32,
    pub generated_at: DateTime<Utc>,
}

impl ConsolidatedReview {
    pub fn count_at(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }
}

/// Collapse titles for duplicate detection: case, punctuation and run-on
/// whitespace are not signal.
fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_space = true;
    for c in title.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn ranges_touch(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 <= b.1 + 1 && b.0 <= a.1 + 1
}

/// Fold resolved passes into findings and coverage gaps.
///
/// Passes are consumed in index order, so merge tie-breaks (which title and
/// description survive) are deterministic. Unresolved and failed passes
/// become gaps; unparseable responses become gaps too, never errors.
pub fn consolidate(
    passes: &[ReviewPass],
    chunk_table: &HashMap<ChunkId, Chunk>,
) -> (Vec<Finding>, Vec<CoverageGap>) {
    let mut findings: Vec<Finding> = Vec::new();
    let mut gaps: Vec<CoverageGap> = Vec::new();

    for pass in passes {
        let response = match &pass.outcome {
            PassOutcome::Success { response } => response,
            PassOutcome::Failed { error } => {
                gaps.push(CoverageGap {
                    pass_index: pass.index,
                    chunk_ids: pass.chunk_ids.clone(),
                    reason: error.to_string(),
                });
                continue;
            }
            PassOutcome::Pending => {
                gaps.push(CoverageGap {
                    pass_index: pass.index,
                    chunk_ids: pass.chunk_ids.clone(),
                    reason: "pass never resolved".to_string(),
                });
                continue;
            }
        };

        let raw = match parse_findings(pass.index, response) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(pass = pass.index, %err, "response discarded");
                gaps.push(CoverageGap {
                    pass_index: pass.index,
                    chunk_ids: pass.chunk_ids.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
        };

        for finding in raw {
            let chunk_id = pass
                .chunk_ids
                .iter()
                .find(|id| id.as_str() == finding.chunk)
                .or_else(|| pass.chunk_ids.first());
            let Some(chunk_id) = chunk_id else {
                continue;
            };
            let Some(chunk) = chunk_table.get(chunk_id) else {
                continue;
            };

            let line_space = chunk.primary_line_count();
            if line_space == 0 {
                continue;
            }
            let local_start = finding.line.clamp(1, line_space);
            let local_end = finding
                .end_line
                .unwrap_or(finding.line)
                .clamp(local_start, line_space);

            let Some((path, start_line)) = chunk.absolute_line(local_start) else {
                continue;
            };
            let end_line = chunk
                .absolute_line(local_end)
                .map(|(_, l)| l)
                .unwrap_or(start_line);

            findings.push(Finding {
                chunk_ids: vec![chunk_id.clone()],
                file: path.to_path_buf(),
                start_line,
                end_line: end_line.max(start_line),
                severity: parse_severity(&finding.severity),
                title: finding.title,
                description: finding.description,
                fingerprint: String::new(),
            });
        }
    }

    let findings = dedup_findings(findings);
    (findings, gaps)
}

/// Merge findings that name the same issue: same file, same normalized
/// title, touching line ranges. Higher severity wins; ties keep the first
/// in pass order. Line ranges union.
fn dedup_findings(raw: Vec<Finding>) -> Vec<Finding> {
    let mut merged: Vec<(String, Finding)> = Vec::new();

    for finding in raw {
        let norm = normalize_title(&finding.title);
        let existing = merged.iter_mut().find(|(n, f)| {
            *n == norm
                && f.file == finding.file
                && ranges_touch(
                    (f.start_line, f.end_line),
                    (finding.start_line, finding.end_line),
                )
        });

        match existing {
            Some((_, kept)) => {
                kept.start_line = kept.start_line.min(finding.start_line);
                kept.end_line = kept.end_line.max(finding.end_line);
                if finding.severity > kept.severity {
                    kept.severity = finding.severity;
                }
                for id in finding.chunk_ids {
                    if !kept.chunk_ids.contains(&id) {
                        kept.chunk_ids.push(id);
                    }
                }
            }
            None => merged.push((norm, finding)),
        }
    }

    let mut out: Vec<Finding> = merged
        .into_iter()
        .map(|(norm, mut f)| {
            f.fingerprint = format!("{}|{}|{}-{}", f.file.display(), norm, f.start_line, f.end_line);
            f
        })
        .collect();

    out.sort_by(|a, b| {
        (&a.file, a.start_line, a.end_line, &a.title).cmp(&(
            &b.file,
            b.start_line,
            b.end_line,
            &b.title,
        ))
    });
    out
}

/// Prompt for the narrative-summary pass over the consolidated findings.
pub(crate) fn build_summary_prompt(findings: &[Finding], files_reviewed: usize) -> String {
    let mut prompt = format!(
        "Summarize this code review of {} file(s) in two or three sentences of plain prose.\n\
         Findings:\n",
        files_reviewed
    );
    for f in findings.iter().take(40) {
        prompt.push_str(&format!(
            "- [{}] {}:{} {}\n",
            f.severity.label(),
            f.file.display(),
            f.start_line,
            f.title
        ));
    }
    if findings.is_empty() {
        prompt.push_str("- none\n");
    }
    prompt
}

/// Deterministic fallback summary used when the narrative pass fails or is
/// disabled.
pub(crate) fn templated_summary(
    findings: &[Finding],
    files_reviewed: usize,
    gaps: usize,
) -> String {
    let count = |s: Severity| findings.iter().filter(|f| f.severity == s).count();
    let mut summary = format!(
        "Reviewed {} file(s): {} critical, {} warning(s), {} suggestion(s), {} nitpick(s).",
        files_reviewed,
        count(Severity::Critical),
        count(Severity::Warning),
        count(Severity::Suggestion),
        count(Severity::Nitpick),
    );
    if gaps > 0 {
        summary.push_str(&format!(" {} pass(es) left coverage gaps.", gaps));
    }
    summary
}
