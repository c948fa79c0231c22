//! Retrieval-augmented generation loop.
//!
//! One call to [`Generator::generate`] answers one prompt:
//!
//! 1. retrieve the best matching knowledge document and append it to the prompt
//! 2. tokenize and check the prompt against the context window
//! 3. evaluate the prompt in a single batch
//! 4. greedily sample up to `max_new_tokens` tokens, decoding each one
//!
//! Failures before the first generated token are reported as a
//! [`Diagnostic`]; the loop itself never fails, it only stops, and whatever
//! text was produced so far is kept.

use std::fmt;

use llama_engine::{DecodeBatch, DecodeContext, InferenceBackend, Pos, Vocabulary};
use llama_rag::{augment_prompt, KnowledgeStore};
use llama_sampling::{TokenDataArray, TokenSampler};

use crate::config::{ContextPolicy, GenerationConfig};
use crate::lifecycle::ResourceManager;
use crate::telemetry::{GenerationMetrics, GenerationTimer, TelemetryHook, TracingTelemetry};

/// Reasons a query is answered with a fixed message instead of generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    NotInitialized,
    VocabUnavailable,
    TokenizationFailed,
    PromptTooLong,
    PromptEvalFailed,
}

impl Diagnostic {
    /// The exact text returned to callers.
    pub fn message(self) -> &'static str {
        match self {
            Diagnostic::NotInitialized => "LLM not initialized.",
            Diagnostic::VocabUnavailable => "Vocab not available.",
            Diagnostic::TokenizationFailed => "Tokenization failed.",
            Diagnostic::PromptTooLong => "Prompt too long for model context window.",
            Diagnostic::PromptEvalFailed => "Failed to evaluate prompt.",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Why the sampling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
    NanLogits,
    InvalidSelection,
    DecodeFailed,
    LogitsUnavailable,
}

/// Result of one query.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Rejected(Diagnostic),
    Completed {
        text: String,
        stop: StopReason,
        metrics: GenerationMetrics,
    },
}

impl GenerationOutcome {
    /// Text handed back to callers: the diagnostic message or the generated
    /// text (possibly empty).
    pub fn text(&self) -> &str {
        match self {
            GenerationOutcome::Rejected(diag) => diag.message(),
            GenerationOutcome::Completed { text, .. } => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            GenerationOutcome::Rejected(diag) => diag.message().to_string(),
            GenerationOutcome::Completed { text, .. } => text,
        }
    }

    pub fn diagnostic(&self) -> Option<Diagnostic> {
        match self {
            GenerationOutcome::Rejected(diag) => Some(*diag),
            GenerationOutcome::Completed { .. } => None,
        }
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            GenerationOutcome::Rejected(_) => None,
            GenerationOutcome::Completed { stop, .. } => Some(*stop),
        }
    }

    pub fn metrics(&self) -> Option<&GenerationMetrics> {
        match self {
            GenerationOutcome::Rejected(_) => None,
            GenerationOutcome::Completed { metrics, .. } => Some(metrics),
        }
    }
}

/// Builds fresh sampler state for one query.
pub type SamplerFactory = Box<dyn Fn() -> Box<dyn TokenSampler> + Send + Sync>;

/// Drives generation against a [`ResourceManager`].
pub struct Generator {
    config: GenerationConfig,
    telemetry: Box<dyn TelemetryHook>,
    sampler_factory: Option<SamplerFactory>,
}

impl Default for Generator {
    fn default() -> Self {
        Self::new(GenerationConfig::default())
    }
}

impl fmt::Debug for Generator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("config", &self.config)
            .field("custom_sampler", &self.sampler_factory.is_some())
            .finish_non_exhaustive()
    }
}

impl Generator {
    pub fn new(config: GenerationConfig) -> Self {
        Self {
            config,
            telemetry: Box::new(TracingTelemetry),
            sampler_factory: None,
        }
    }

    pub fn with_telemetry(mut self, hook: impl TelemetryHook + 'static) -> Self {
        self.telemetry = Box::new(hook);
        self
    }

    /// Sample with strategies built by `factory` instead of the configured
    /// [`SamplerKind`](crate::SamplerKind). Called once per query.
    pub fn with_sampler_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn TokenSampler> + Send + Sync + 'static,
    {
        self.sampler_factory = Some(Box::new(factory));
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    fn new_sampler(&self) -> Box<dyn TokenSampler> {
        match &self.sampler_factory {
            Some(factory) => factory(),
            None => self.config.sampler.build(),
        }
    }

    /// Answer `prompt`, augmented with the best match from `store`.
    pub fn generate<B: InferenceBackend>(
        &self,
        manager: &mut ResourceManager<B>,
        store: &KnowledgeStore,
        prompt: &str,
    ) -> GenerationOutcome {
        let Some(handles) = manager.handles() else {
            tracing::warn!("query before initialization");
            return GenerationOutcome::Rejected(Diagnostic::NotInitialized);
        };

        let retrieved = store.retrieve_best_match(prompt);
        tracing::debug!(matched = retrieved.is_some(), "knowledge lookup");
        let augmented = augment_prompt(prompt, retrieved);

        let Some(vocab) = handles.vocab else {
            tracing::warn!("model has no vocabulary");
            return GenerationOutcome::Rejected(Diagnostic::VocabUnavailable);
        };

        let tokens = match vocab.tokenize(
            &augmented,
            self.config.add_special,
            self.config.parse_special,
        ) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => {
                tracing::warn!("prompt produced no tokens");
                return GenerationOutcome::Rejected(Diagnostic::TokenizationFailed);
            }
            Err(err) => {
                tracing::warn!(error = %err, "tokenization failed");
                return GenerationOutcome::Rejected(Diagnostic::TokenizationFailed);
            }
        };
        tracing::debug!(n_tokens = tokens.len(), ?tokens, "prompt tokenized");

        if tokens.len() > self.config.context_window {
            tracing::warn!(
                n_tokens = tokens.len(),
                window = self.config.context_window,
                "prompt exceeds context window"
            );
            return GenerationOutcome::Rejected(Diagnostic::PromptTooLong);
        }

        let context = handles.context;
        let start = self.start_position(context, tokens.len(), handles.n_ctx);

        let mut timer = GenerationTimer::new(tokens.len(), self.telemetry.as_ref());
        if let Err(err) = context.decode(&DecodeBatch::for_prompt(&tokens, start)) {
            tracing::warn!(error = %err, "prompt decode failed");
            return GenerationOutcome::Rejected(Diagnostic::PromptEvalFailed);
        }
        timer.mark_prompt_evaluated();

        let mut sampler = self.new_sampler();
        tracing::trace!(sampler = sampler.name(), "sampling");
        let n_vocab = vocab.n_tokens();
        let eos = vocab.eos();
        let mut pos = start + tokens.len() as Pos;
        let mut text = String::new();
        let mut stop = StopReason::MaxTokens;

        for step in 0..self.config.max_new_tokens {
            let logits = match context.logits() {
                Some(logits) if logits.len() >= n_vocab => &logits[..n_vocab],
                _ => {
                    tracing::warn!(step, "logits unavailable");
                    stop = StopReason::LogitsUnavailable;
                    break;
                }
            };
            if logits.iter().any(|l| l.is_nan()) {
                tracing::warn!(step, "NaN in logits");
                stop = StopReason::NanLogits;
                break;
            }

            let mut candidates = TokenDataArray::from_logits(logits);
            let token = match sampler.sample(&mut candidates) {
                Ok(token) => token,
                Err(err) => {
                    tracing::warn!(step, error = %err, "sampler made no valid selection");
                    stop = StopReason::InvalidSelection;
                    break;
                }
            };
            tracing::debug!(step, token, "sampled");

            if token == eos {
                stop = StopReason::EndOfSequence;
                break;
            }
            if let Some(piece) = vocab.token_text(token) {
                text.push_str(&piece);
            }
            timer.mark_token();

            if let Err(err) = context.decode(&DecodeBatch::single(token, pos)) {
                tracing::warn!(step, error = %err, "token decode failed");
                stop = StopReason::DecodeFailed;
                break;
            }
            pos += 1;
        }

        let metrics = timer.finish(stop);
        GenerationOutcome::Completed {
            text,
            stop,
            metrics,
        }
    }

    /// Position for the prompt batch, clearing the context when needed.
    fn start_position<C: DecodeContext>(&self, context: &mut C, n_prompt: usize, n_ctx: u32) -> Pos {
        match self.config.context_policy {
            ContextPolicy::ResetPerQuery => {
                context.clear_memory();
                0
            }
            ContextPolicy::Continuous => {
                let start = context.position();
                let needed = start as u64 + n_prompt as u64 + self.config.max_new_tokens as u64;
                if needed > u64::from(n_ctx) {
                    tracing::info!(start, n_ctx, "context exhausted; starting over");
                    context.clear_memory();
                    0
                } else {
                    start
                }
            }
        }
    }
}
