//! # llama-engine
//!
//! The "narrow waist" of the llama-rag stack. Defines the capability traits an
//! inference backend must provide (model loading, vocabulary, stateful decode
//! context) and the [`DecodeBatch`] handed to it. Everything above this crate
//! depends on *engine behavior*, not on a particular implementation, so a
//! scripted backend and a native one are interchangeable.
//!
//! ## Design Notes
//!
//! ### Ownership
//! Models and contexts are plain owned values. A context never borrows its
//! model; whoever owns both (the lifecycle manager) decides the release order.
//! Both must be `Send` so an owner can sit behind a `Mutex` shared by threads.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are
//! logically non-negative.

use std::path::Path;

pub mod batch;

pub use batch::{BatchEntry, DecodeBatch};

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Absolute position of a token inside a sequence.
pub type Pos = i32;

/// Sequence membership tag. This stack only ever decodes sequence 0.
pub type SeqId = i32;

/// Top-level error type for all engine operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Context creation failed: {0}")]
    ContextCreate(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Batch capacity exceeded: {capacity} tokens")]
    BatchFull { capacity: usize },
}

/// Parameters for building a decode context on top of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Number of positions the context can hold (prompt + generated).
    pub n_ctx: u32,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self { n_ctx: 544 }
    }
}

/// Tokenizer view of a loaded model.
pub trait Vocabulary {
    /// Number of tokens in the vocabulary; also the length of a logit vector.
    fn n_tokens(&self) -> usize;

    /// Convert text into token IDs.
    ///
    /// `add_special` lets the tokenizer add model-specific begin/end markers;
    /// `parse_special` lets special-token text in the input map to those tokens.
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool)
        -> Result<Vec<TokenId>>;

    /// Raw text of a single token, if the vocabulary has one for it.
    fn token_text(&self, token: TokenId) -> Option<String>;

    /// End-of-sequence marker.
    fn eos(&self) -> TokenId;
}

/// A loaded set of model weights.
pub trait Model: Send {
    type Vocab: Vocabulary;

    /// The model's vocabulary, if it ships one.
    fn vocab(&self) -> Option<&Self::Vocab>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String {
        String::from("model")
    }
}

/// Stateful decode session bound to one model (KV cache + sequence position).
pub trait DecodeContext: Send {
    /// Run one forward pass over `batch`, updating internal state.
    fn decode(&mut self, batch: &DecodeBatch) -> Result<()>;

    /// Logits produced for the last entry of the most recent batch.
    fn logits(&self) -> Option<&[f32]>;

    /// Next free position (number of positions already filled).
    fn position(&self) -> Pos;

    /// Drop all cached state and rewind to position 0.
    fn clear_memory(&mut self);
}

/// The core backend trait: produces models and contexts.
pub trait InferenceBackend: Send + Sync {
    type Model: Model;
    type Context: DecodeContext;

    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Load model weights from disk.
    fn load_model(&self, path: &Path) -> Result<Self::Model>;

    /// Construct a decode context for `model`.
    fn new_context(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context>;
}
