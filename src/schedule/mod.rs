//! Pass scheduler
//!
//! Executes a pass plan against the injected model-invocation capability.
//! Passes run independently, concurrent up to a ceiling; one failed pass
//! never aborts the run. The scheduler suspends only while waiting on the
//! invoker; it performs no blocking I/O of its own.

use crate::chunk::{Chunk, ChunkId};
use crate::config::{EngineConfig, ModelConfig};
use crate::error::PassError;
use crate::intent::ReviewIntent;
use crate::source::{ModelInvoker, SourceSet};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Terminal state of one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PassOutcome {
    Pending,
    Success { response: String },
    Failed { error: PassError },
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PassOutcome::Success { .. })
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, PassOutcome::Pending)
    }
}

/// One model invocation over one or more chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewPass {
    pub index: usize,
    pub chunk_ids: Vec<ChunkId>,
    pub intent: ReviewIntent,
    pub estimated_tokens: u32,
    pub outcome: PassOutcome,
}

impl ReviewPass {
    pub fn new(
        index: usize,
        chunk_ids: Vec<ChunkId>,
        intent: ReviewIntent,
        estimated_tokens: u32,
    ) -> Self {
        Self {
            index,
            chunk_ids,
            intent,
            estimated_tokens,
            outcome: PassOutcome::Pending,
        }
    }
}

/// Cooperative cancellation pair. The caller holds the handle; the engine
/// watches the token between and during passes.
pub fn cancel_channel() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. A dropped handle without a
    /// cancel never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Assemble the prompt for one pass: an instruction header, then each chunk
/// rendered with its id and chunk-local line numbers.
pub fn build_pass_prompt(chunks: &[&Chunk], sources: &SourceSet, intent: ReviewIntent) -> String {
    let mut prompt = format!(
        "Review the following code for {} issues.\n\
         Respond with JSON only, in this shape:\n\
         {{\"findings\": [{{\"chunk\": \"<chunk id>\", \"line\": <number>, \"end_line\": <number>, \
         \"severity\": \"critical|warning|suggestion|nitpick\", \"title\": \"...\", \
         \"description\": \"...\"}}]}}\n\
         Line numbers refer to the numbered lines within each chunk.\n",
        intent.label()
    );

    for chunk in chunks {
        prompt.push_str(&format!("\n## chunk {}\n", chunk.id));
        prompt.push_str(&chunk.render(sources));
    }

    prompt
}

/// Run all passes, up to `config.concurrency` in flight at once.
///
/// Every pass resolves to success or failure unless cancellation arrives
/// first; passes still pending at cancellation are abandoned as-is. The
/// returned list is in pass-index order regardless of completion order.
pub async fn run_passes(
    mut passes: Vec<ReviewPass>,
    prompts: Vec<String>,
    invoker: &dyn ModelInvoker,
    model: &ModelConfig,
    config: &EngineConfig,
    cancel: Option<&CancelToken>,
) -> Vec<ReviewPass> {
    debug_assert_eq!(passes.len(), prompts.len());
    let deadline = config.pass_deadline;

    let indexes: Vec<usize> = passes.iter().map(|p| p.index).collect();
    let jobs = indexes
        .into_iter()
        .zip(prompts)
        .map(|(index, prompt)| async move {
            debug!(pass = index, "dispatching pass");
            let outcome = match tokio::time::timeout(deadline, invoker.invoke(prompt, model)).await
            {
                Ok(Ok(response)) => PassOutcome::Success { response },
                Ok(Err(err)) => {
                    let error = PassError::from_invoke(index, err);
                    warn!(pass = index, %error, "pass failed");
                    PassOutcome::Failed { error }
                }
                Err(_) => {
                    let error = PassError::timeout(index);
                    warn!(pass = index, %error, "pass deadline exceeded");
                    PassOutcome::Failed { error }
                }
            };
            (index, outcome)
        });

    let mut in_flight = futures::stream::iter(jobs).buffer_unordered(config.concurrency.max(1));

    loop {
        tokio::select! {
            // record already-completed work before honoring a cancel
            biased;
            resolved = in_flight.next() => {
                match resolved {
                    Some((index, outcome)) => {
                        if let Some(pass) = passes.iter_mut().find(|p| p.index == index) {
                            pass.outcome = outcome;
                        }
                    }
                    None => break,
                }
            }
            _ = wait_cancelled(cancel) => {
                warn!("review cancelled; abandoning outstanding passes");
                break;
            }
        }
    }

    passes
}

async fn wait_cancelled(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvokeError;
    use futures::future::BoxFuture;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted invoker: responds per call index, optionally slow.
    struct ScriptedInvoker {
        calls: AtomicUsize,
        fail_on: Option<usize>,
        delay: Duration,
    }

    impl ScriptedInvoker {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on: None,
                delay: Duration::ZERO,
            }
        }
    }

    impl ModelInvoker for ScriptedInvoker {
        fn invoke<'a>(
            &'a self,
            _prompt: String,
            _config: &'a ModelConfig,
        ) -> BoxFuture<'a, Result<String, InvokeError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                if self.fail_on == Some(call) {
                    Err(InvokeError::transient(anyhow::anyhow!("rate limited")))
                } else {
                    Ok(format!("{{\"findings\": []}} call {}", call))
                }
            })
        }
    }

    fn pending_passes(n: usize) -> (Vec<ReviewPass>, Vec<String>) {
        let passes = (0..n)
            .map(|i| {
                ReviewPass::new(
                    i,
                    vec![ChunkId::new(Path::new("x.rs"), "grouped", i)],
                    ReviewIntent::General,
                    10,
                )
            })
            .collect();
        let prompts = (0..n).map(|i| format!("prompt {}", i)).collect();
        (passes, prompts)
    }

    #[tokio::test]
    async fn test_all_passes_resolve() {
        let invoker = ScriptedInvoker::ok();
        let (passes, prompts) = pending_passes(3);
        let done = run_passes(
            passes,
            prompts,
            &invoker,
            &ModelConfig::default(),
            &EngineConfig::default(),
            None,
        )
        .await;

        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|p| p.outcome.is_success()));
        // in pass-index order regardless of completion order
        let indexes: Vec<usize> = done.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let invoker = ScriptedInvoker {
            calls: AtomicUsize::new(0),
            fail_on: Some(1),
            delay: Duration::ZERO,
        };
        let (passes, prompts) = pending_passes(3);
        let done = run_passes(
            passes,
            prompts,
            &invoker,
            &ModelConfig::default(),
            &EngineConfig::default(),
            None,
        )
        .await;

        let successes = done.iter().filter(|p| p.outcome.is_success()).count();
        let failures = done.iter().filter(|p| matches!(p.outcome, PassOutcome::Failed { .. })).count();
        assert_eq!(successes, 2);
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_deadline_becomes_transient_failure() {
        let invoker = ScriptedInvoker {
            calls: AtomicUsize::new(0),
            fail_on: None,
            delay: Duration::from_millis(200),
        };
        let mut config = EngineConfig::default();
        config.pass_deadline = Duration::from_millis(10);

        let (passes, prompts) = pending_passes(1);
        let done = run_passes(
            passes,
            prompts,
            &invoker,
            &ModelConfig::default(),
            &config,
            None,
        )
        .await;

        match &done[0].outcome {
            PassOutcome::Failed { error } => assert!(error.is_transient()),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_abandons_outstanding_passes() {
        let invoker = ScriptedInvoker {
            calls: AtomicUsize::new(0),
            fail_on: None,
            delay: Duration::from_secs(5),
        };
        let (handle, token) = cancel_channel();
        handle.cancel();

        let (passes, prompts) = pending_passes(2);
        let done = run_passes(
            passes,
            prompts,
            &invoker,
            &ModelConfig::default(),
            &EngineConfig::default(),
            Some(&token),
        )
        .await;

        assert!(done.iter().all(|p| !p.outcome.is_resolved()));
    }

    #[test]
    fn test_prompt_contains_chunk_ids_and_intent() {
        let unit = crate::source::SourceUnit::new("p.rs", "fn a() {}\n");
        let sources = SourceSet::new(vec![unit.clone()]);
        let est = crate::budget::CharEstimator::default();
        let chunks = crate::chunk::strategies::whole_file(&unit, &est);
        let refs: Vec<&Chunk> = chunks.iter().collect();

        let prompt = build_pass_prompt(&refs, &sources, ReviewIntent::Security);
        assert!(prompt.contains("security"));
        assert!(prompt.contains(chunks[0].id.as_str()));
        assert!(prompt.contains("   1| fn a() {}"));
    }
}
