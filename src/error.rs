//! Error taxonomy for the review engine
//!
//! Every error here resolves somewhere inside the engine: a `ParseError`
//! demotes one unit to line-based chunking, a `PlanningError` demotes the
//! whole run one tier, a `PassError` marks a single pass failed, and a
//! `ConsolidationError` falls back to the templated summary. The only error
//! that escapes `review()` is `ReviewError::Cancelled`.

use crate::chunk::ChunkId;
use std::path::PathBuf;
use thiserror::Error;

/// A source unit could not be parsed into declaration boundaries.
///
/// Non-fatal: it only disqualifies syntax-aware strategies for that unit.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no parser support for {path}")]
    UnsupportedLanguage { path: PathBuf },

    #[error("parser failed for {path}: {message}")]
    ParserFailed { path: PathBuf, message: String },
}

/// No valid pass plan could be produced at the current tier.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("token budget is empty: context window {window} <= reserved {reserved}")]
    EmptyBudget { window: u32, reserved: u32 },

    #[error("chunk {chunk_id} cannot be split to fit the pass budget")]
    UnsplittableChunk { chunk_id: ChunkId },

    #[error("no chunks available to plan")]
    NoChunks,
}

/// Whether a pass failure is worth retrying by the caller's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PassErrorKind {
    /// Timeout, rate limit - the caller's client may retry
    Transient,
    /// Bad request, auth failure - retrying will not help
    Permanent,
}

/// One pass failed. Isolated: the scheduler keeps running the others.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("pass {pass_index} failed ({kind:?}): {message}")]
pub struct PassError {
    pub pass_index: usize,
    pub kind: PassErrorKind,
    pub message: String,
}

impl PassError {
    pub fn timeout(pass_index: usize) -> Self {
        Self {
            pass_index,
            kind: PassErrorKind::Transient,
            message: "deadline exceeded".to_string(),
        }
    }

    pub fn from_invoke(pass_index: usize, err: InvokeError) -> Self {
        Self {
            pass_index,
            kind: err.kind,
            message: format!("{:#}", err.source),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == PassErrorKind::Transient
    }
}

/// Error reported by the injected model-invocation capability.
///
/// The engine treats the inner error as opaque; only the kind matters for
/// scheduling decisions.
#[derive(Debug, Error)]
#[error("{kind:?} invocation error: {source:#}")]
pub struct InvokeError {
    pub kind: PassErrorKind,
    #[source]
    pub source: anyhow::Error,
}

impl InvokeError {
    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: PassErrorKind::Transient,
            source: source.into(),
        }
    }

    pub fn permanent(source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: PassErrorKind::Permanent,
            source: source.into(),
        }
    }
}

/// A pass response could not be turned into findings.
///
/// Never aborts a review: the offending pass is recorded as a coverage gap
/// and consolidation continues with the rest.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error("pass {pass_index} response contains no findings payload")]
    MissingPayload { pass_index: usize },

    #[error("pass {pass_index} findings could not be parsed: {message}")]
    UnparseableResponse { pass_index: usize, message: String },
}

/// The only error that can escape the top-level `review()` call.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review was cancelled before any pass resolved")]
    Cancelled,
}
