//! Review engine library crate
//!
//! Chunks large source trees into pass plans that fit a model's context
//! window, runs the passes concurrently through an injected model client,
//! and consolidates the responses into one deduplicated report. I/O stays
//! outside: callers feed `SourceUnit`s in and a `ModelInvoker` impl out.

pub mod budget;
pub mod cascade;
pub mod chunk;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod index;
pub mod intent;
pub mod schedule;
pub mod source;

pub use budget::{CharEstimator, PlannedPass, TokenBudget, TokenEstimator};
pub use cascade::{review, Tier};
pub use chunk::{Chunk, ChunkId, ChunkingStrategy};
pub use config::{EngineConfig, ModelConfig};
pub use consolidate::{ConsolidatedReview, CoverageGap, Finding, Severity};
pub use error::{InvokeError, PassError, PassErrorKind, ReviewError};
pub use intent::ReviewIntent;
pub use schedule::{cancel_channel, CancelHandle, CancelToken, PassOutcome, ReviewPass};
pub use source::{Language, ModelInvoker, SourceProvider, SourceSet, SourceUnit};
