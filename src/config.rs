//! Engine configuration
//!
//! Plain value structs supplied by the caller. The engine reads no
//! environment variables and no config files; whatever flags or env toggles
//! exist in the CLI are mapped into these values before calling in.

use std::time::Duration;

/// Per-model limits supplied by the caller. The engine does not know
/// provider specifics, only how much room a call has.
#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    /// Total context window of the selected model, in tokens
    pub context_window: u32,
    /// Tokens reserved for the prompt scaffold and the model's output
    pub reserved_tokens: u32,
}

impl ModelConfig {
    pub fn new(context_window: u32, reserved_tokens: u32) -> Self {
        Self {
            context_window,
            reserved_tokens,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            reserved_tokens: 16_384,
        }
    }
}

/// Tunable policy knobs for chunking, planning and scheduling.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on chunks packed into one pass, even when the token
    /// budget would allow more (bounds model output dilution)
    pub max_chunks_per_pass: usize,
    /// Concurrent in-flight passes
    pub concurrency: usize,
    /// Per-pass deadline; exceeding it is a transient pass failure
    pub pass_deadline: Duration,
    /// Window height for line-based chunking
    pub line_window: usize,
    /// Overlap between consecutive line windows
    pub line_overlap: usize,
    /// Target chunk size for the grouped/contextual strategies, in tokens
    pub grouped_target_tokens: u32,
    /// Cap on declarations merged into one functional group
    pub functional_group_max: usize,
    /// Run the model-backed narrative summary when more than one pass exists
    pub narrative_summary: bool,
    /// On cancellation, consolidate already-resolved passes instead of
    /// reporting Cancelled
    pub partial_on_cancel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunks_per_pass: 24,
            concurrency: 4,
            pass_deadline: Duration::from_secs(120),
            line_window: 120,
            line_overlap: 10,
            grouped_target_tokens: 1_200,
            functional_group_max: 8,
            narrative_summary: true,
            partial_on_cancel: false,
        }
    }
}
