//! Generation configuration.
//!
//! Loaded from JSON (every field optional) or built in code with the
//! `with_*` builders. Defaults reproduce the classic behaviour: a 512-token
//! prompt window and a 32-token greedy generation budget.

use std::path::Path;

use llama_engine::ContextParams;
use llama_sampling::{GreedySampler, TokenSampler};
use serde::Deserialize;

/// Maximum prompt length in tokens.
pub const DEFAULT_CONTEXT_WINDOW: usize = 512;

/// Maximum number of generated tokens (decode steps) per query.
pub const DEFAULT_MAX_NEW_TOKENS: usize = 32;

/// Errors from loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Token selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    Greedy,
}

impl SamplerKind {
    /// Fresh sampler state for one query.
    pub fn build(self) -> Box<dyn TokenSampler> {
        match self {
            SamplerKind::Greedy => Box::new(GreedySampler::new()),
        }
    }
}

/// What happens to the shared decode context between queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextPolicy {
    /// Clear the context and start every prompt at position 0.
    #[default]
    ResetPerQuery,
    /// Keep one running conversation; each prompt continues at the
    /// context's current position.
    Continuous,
}

/// Generation parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Prompts tokenizing to more tokens than this are rejected.
    pub context_window: usize,

    /// Upper bound on generated tokens per query.
    pub max_new_tokens: usize,

    pub sampler: SamplerKind,

    pub context_policy: ContextPolicy,

    /// Let the tokenizer add model-specific begin/end markers.
    pub add_special: bool,

    /// Map special-token text in the prompt to special tokens.
    pub parse_special: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            sampler: SamplerKind::default(),
            context_policy: ContextPolicy::default(),
            add_special: true,
            parse_special: true,
        }
    }
}

impl GenerationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context_window(mut self, n: usize) -> Self {
        self.context_window = n;
        self
    }

    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = n;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_context_policy(mut self, policy: ContextPolicy) -> Self {
        self.context_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context_window == 0 {
            return Err(ConfigError::Invalid(
                "context_window must be at least 1".into(),
            ));
        }
        let total = self
            .context_window
            .checked_add(self.max_new_tokens)
            .and_then(|n| u32::try_from(n).ok());
        if total.is_none() {
            return Err(ConfigError::Invalid(format!(
                "context_window + max_new_tokens overflows: {} + {}",
                self.context_window, self.max_new_tokens
            )));
        }
        Ok(())
    }

    /// Context sized to hold a full prompt plus the whole generation budget.
    pub fn context_params(&self) -> ContextParams {
        let n_ctx = self
            .context_window
            .saturating_add(self.max_new_tokens)
            .min(u32::MAX as usize);
        ContextParams {
            n_ctx: n_ctx as u32,
        }
    }
}

/// Load and validate a JSON configuration file.
pub fn load_config(path: &Path) -> Result<GenerationConfig, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    let config: GenerationConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}
