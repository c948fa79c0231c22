//! Deterministic reference backend.
//!
//! A [`ScriptedBackend`] "loads" a JSON model card instead of weights. The
//! card names a word-piece vocabulary and a scripted reply; the decode
//! context then emits logits that make a greedy sampler produce exactly that
//! reply followed by end-of-sequence. Positions are checked the way a real KV
//! cache would check them, so the generation loop is exercised faithfully.
//!
//! ```json
//! {
//!   "vocab": ["<unk>", "<s>", "</s>", "▁Paris", "▁is", "▁the", "▁capital."],
//!   "reply": ["Paris", "is", "the", "capital."]
//! }
//! ```
//!
//! Fault injection knobs (`nan_at_step`, `short_logits_at_step`,
//! `fail_decode_at_step`, `fail_prompt_decode`, `fail_context`,
//! `vocab_available`) drive the error paths of the generation loop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use llama_engine::{
    ContextParams, DecodeBatch, DecodeContext, InferenceBackend, LlamaError, Model, Pos, Result,
    TokenId, Vocabulary,
};
use serde::Deserialize;

use crate::text::WORD_MARKER;

/// Logit given to the scripted token; every other entry is 0.
const TARGET_LOGIT: f32 = 10.0;

fn default_vocab() -> Vec<String> {
    vec!["<unk>".into(), "<s>".into(), "</s>".into()]
}

fn default_bos() -> TokenId {
    1
}

fn default_eos() -> TokenId {
    2
}

fn default_true() -> bool {
    true
}

/// JSON description of a scripted model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelCard {
    /// Token pieces, indexed by token id.
    #[serde(default = "default_vocab")]
    pub vocab: Vec<String>,

    #[serde(default)]
    pub unk_token_id: TokenId,

    #[serde(default = "default_bos")]
    pub bos_token_id: TokenId,

    #[serde(default = "default_eos")]
    pub eos_token_id: TokenId,

    /// Prepend BOS when the caller asks for special tokens.
    #[serde(default = "default_true")]
    pub add_bos: bool,

    /// Words the model answers with, resolved like prompt words.
    #[serde(default)]
    pub reply: Vec<String>,

    /// End the reply with EOS; otherwise the reply repeats forever.
    #[serde(default = "default_true")]
    pub emit_eos: bool,

    /// Generation step whose logits contain a NaN.
    #[serde(default)]
    pub nan_at_step: Option<usize>,

    /// Generation step whose logits are one entry short of the vocabulary.
    #[serde(default)]
    pub short_logits_at_step: Option<usize>,

    /// Generation step whose token fails to decode.
    #[serde(default)]
    pub fail_decode_at_step: Option<usize>,

    #[serde(default)]
    pub fail_prompt_decode: bool,

    #[serde(default)]
    pub fail_context: bool,

    #[serde(default = "default_true")]
    pub vocab_available: bool,
}

impl Default for ModelCard {
    fn default() -> Self {
        Self {
            vocab: default_vocab(),
            unk_token_id: 0,
            bos_token_id: default_bos(),
            eos_token_id: default_eos(),
            add_bos: true,
            reply: Vec::new(),
            emit_eos: true,
            nan_at_step: None,
            short_logits_at_step: None,
            fail_decode_at_step: None,
            fail_prompt_decode: false,
            fail_context: false,
            vocab_available: true,
        }
    }
}

impl ModelCard {
    /// Card with the three special tokens plus one `▁word` piece per word.
    pub fn with_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut card = Self::default();
        card.vocab.extend(
            words
                .into_iter()
                .map(|w| format!("{WORD_MARKER}{}", w.as_ref())),
        );
        card
    }

    pub fn with_reply<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reply = words.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LlamaError::ModelLoad(format!("bad model card: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| LlamaError::ModelLoad(format!("{}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    fn check_special(&self, name: &str, id: TokenId) -> Result<()> {
        if id < 0 || id as usize >= self.vocab.len() {
            return Err(LlamaError::ModelLoad(format!(
                "{name} {id} outside vocabulary of {}",
                self.vocab.len()
            )));
        }
        Ok(())
    }
}

/// Shared instrumentation counters.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    decode_calls: AtomicUsize,
    models_loaded: AtomicUsize,
    contexts_created: AtomicUsize,
    releases: Mutex<Vec<&'static str>>,
}

impl ScriptedStats {
    /// Every `decode` call, successful or not.
    pub fn decode_calls(&self) -> usize {
        self.inner.decode_calls.load(Ordering::SeqCst)
    }

    pub fn models_loaded(&self) -> usize {
        self.inner.models_loaded.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.inner.contexts_created.load(Ordering::SeqCst)
    }

    /// Order in which handles were dropped (`"context"`, `"model"`).
    pub fn releases(&self) -> Vec<&'static str> {
        self.inner
            .releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_release(&self, what: &'static str) {
        self.inner
            .releases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(what);
    }
}

/// Whitespace tokenizer over a fixed piece list.
#[derive(Debug, Clone)]
pub struct ScriptedVocab {
    pieces: Vec<String>,
    index: HashMap<String, TokenId>,
    unk: TokenId,
    bos: TokenId,
    eos: TokenId,
    add_bos: bool,
}

impl ScriptedVocab {
    fn new(card: &ModelCard) -> Self {
        let mut index = HashMap::with_capacity(card.vocab.len());
        for (id, piece) in card.vocab.iter().enumerate() {
            index.entry(piece.clone()).or_insert(id as TokenId);
        }
        Self {
            pieces: card.vocab.clone(),
            index,
            unk: card.unk_token_id,
            bos: card.bos_token_id,
            eos: card.eos_token_id,
            add_bos: card.add_bos,
        }
    }

    fn is_special(&self, id: TokenId) -> bool {
        id == self.unk || id == self.bos || id == self.eos
    }

    /// `▁word` first, then the bare word; unknown words map to UNK.
    fn lookup(&self, word: &str, parse_special: bool) -> TokenId {
        let marked = format!("{WORD_MARKER}{word}");
        let id = self
            .index
            .get(&marked)
            .or_else(|| self.index.get(word))
            .copied()
            .unwrap_or(self.unk);
        if !parse_special && self.is_special(id) && id != self.unk {
            self.unk
        } else {
            id
        }
    }
}

impl Vocabulary for ScriptedVocab {
    fn n_tokens(&self) -> usize {
        self.pieces.len()
    }

    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>> {
        if self.pieces.is_empty() {
            return Err(LlamaError::Tokenization("empty vocabulary".into()));
        }
        let mut tokens = Vec::new();
        if add_special && self.add_bos {
            tokens.push(self.bos);
        }
        tokens.extend(
            text.split_whitespace()
                .map(|word| self.lookup(word, parse_special)),
        );
        Ok(tokens)
    }

    fn token_text(&self, token: TokenId) -> Option<String> {
        usize::try_from(token)
            .ok()
            .and_then(|i| self.pieces.get(i))
            .cloned()
    }

    fn eos(&self) -> TokenId {
        self.eos
    }
}

/// A loaded model card.
#[derive(Debug)]
pub struct ScriptedModel {
    card: ModelCard,
    vocab: ScriptedVocab,
    reply: Arc<Vec<TokenId>>,
    stats: ScriptedStats,
}

impl ScriptedModel {
    fn new(card: ModelCard, stats: ScriptedStats) -> Result<Self> {
        if card.vocab.is_empty() {
            return Err(LlamaError::ModelLoad("model card has no vocabulary".into()));
        }
        card.check_special("unk_token_id", card.unk_token_id)?;
        card.check_special("bos_token_id", card.bos_token_id)?;
        card.check_special("eos_token_id", card.eos_token_id)?;

        let vocab = ScriptedVocab::new(&card);
        let mut reply = Vec::with_capacity(card.reply.len());
        for word in &card.reply {
            let id = vocab.lookup(word, true);
            if id == vocab.unk && word != &vocab.pieces[vocab.unk as usize] {
                return Err(LlamaError::ModelLoad(format!(
                    "reply word {word:?} is not in the vocabulary"
                )));
            }
            reply.push(id);
        }

        Ok(Self {
            card,
            vocab,
            reply: Arc::new(reply),
            stats,
        })
    }

    pub fn card(&self) -> &ModelCard {
        &self.card
    }
}

impl Model for ScriptedModel {
    type Vocab = ScriptedVocab;

    fn vocab(&self) -> Option<&ScriptedVocab> {
        self.card.vocab_available.then_some(&self.vocab)
    }

    fn describe(&self) -> String {
        format!(
            "scripted model ({} tokens, {}-token reply)",
            self.vocab.n_tokens(),
            self.reply.len()
        )
    }
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.stats.record_release("model");
    }
}

/// Decode state for a scripted model.
#[derive(Debug)]
pub struct ScriptedContext {
    n_ctx: u32,
    n_vocab: usize,
    eos: TokenId,
    reply: Arc<Vec<TokenId>>,
    emit_eos: bool,
    nan_at_step: Option<usize>,
    short_logits_at_step: Option<usize>,
    fail_decode_at_step: Option<usize>,
    fail_prompt_decode: bool,
    position: Pos,
    /// Position right after the most recent prompt.
    prompt_end: Pos,
    /// Token the current logits point at; `None` until a prompt is decoded
    /// and after a NaN step.
    pending: Option<TokenId>,
    logits: Option<Vec<f32>>,
    stats: ScriptedStats,
}

impl ScriptedContext {
    fn target(&self, step: usize) -> TokenId {
        match self.reply.get(step) {
            Some(&id) => id,
            None if self.emit_eos || self.reply.is_empty() => self.eos,
            None => self.reply[step % self.reply.len()],
        }
    }

    fn logits_for(&mut self, step: usize) -> Vec<f32> {
        let mut logits = vec![0.0; self.n_vocab];
        if self.nan_at_step == Some(step) {
            logits[0] = f32::NAN;
            self.pending = None;
            return logits;
        }
        let target = self.target(step);
        if let Some(slot) = usize::try_from(target).ok().and_then(|i| logits.get_mut(i)) {
            *slot = TARGET_LOGIT;
        }
        self.pending = Some(target);
        if self.short_logits_at_step == Some(step) {
            logits.truncate(self.n_vocab.saturating_sub(1));
        }
        logits
    }
}

impl DecodeContext for ScriptedContext {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<()> {
        self.stats.inner.decode_calls.fetch_add(1, Ordering::SeqCst);

        let (Some(first), Some(last)) = (batch.first_pos(), batch.last_pos()) else {
            return Err(LlamaError::Decode("empty batch".into()));
        };
        if first != self.position {
            return Err(LlamaError::Decode(format!(
                "batch starts at position {first}, expected {}",
                self.position
            )));
        }
        if last < 0 || last as u32 >= self.n_ctx {
            return Err(LlamaError::Decode(format!(
                "position {last} exceeds context of {} tokens",
                self.n_ctx
            )));
        }

        let next_step = if !batch.is_prompt() {
            if self.pending.is_none() {
                return Err(LlamaError::Decode("no generation in progress".into()));
            }
            let done = (first - self.prompt_end) as usize;
            if self.fail_decode_at_step == Some(done) {
                self.logits = None;
                return Err(LlamaError::Decode(format!("injected failure at step {done}")));
            }
            done + 1
        } else {
            if self.fail_prompt_decode {
                self.logits = None;
                return Err(LlamaError::Decode("injected prompt failure".into()));
            }
            self.prompt_end = last + 1;
            0
        };

        self.position = last + 1;
        self.logits = Some(self.logits_for(next_step));
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn position(&self) -> Pos {
        self.position
    }

    fn clear_memory(&mut self) {
        self.position = 0;
        self.prompt_end = 0;
        self.pending = None;
        self.logits = None;
    }
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.stats.record_release("context");
    }
}

/// Backend reading model cards from disk, or serving a preloaded one.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    preloaded: Option<ModelCard>,
    stats: ScriptedStats,
}

impl ScriptedBackend {
    /// Parse the model file as a JSON model card.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `card` for every load; the file only has to exist.
    pub fn preloaded(card: ModelCard) -> Self {
        Self {
            preloaded: Some(card),
            stats: ScriptedStats::default(),
        }
    }

    pub fn stats(&self) -> ScriptedStats {
        self.stats.clone()
    }
}

impl InferenceBackend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn name(&self) -> &str {
        "scripted"
    }

    fn load_model(&self, path: &Path) -> Result<ScriptedModel> {
        let card = match &self.preloaded {
            Some(card) => card.clone(),
            None => ModelCard::load(path)?,
        };
        let model = ScriptedModel::new(card, self.stats.clone())?;
        self.stats.inner.models_loaded.fetch_add(1, Ordering::SeqCst);
        Ok(model)
    }

    fn new_context(&self, model: &ScriptedModel, params: &ContextParams) -> Result<ScriptedContext> {
        if model.card.fail_context {
            return Err(LlamaError::ContextCreate("injected context failure".into()));
        }
        if params.n_ctx == 0 {
            return Err(LlamaError::ContextCreate("n_ctx must be positive".into()));
        }
        self.stats.inner.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            n_ctx: params.n_ctx,
            n_vocab: model.vocab.n_tokens(),
            eos: model.card.eos_token_id,
            reply: Arc::clone(&model.reply),
            emit_eos: model.card.emit_eos,
            nan_at_step: model.card.nan_at_step,
            short_logits_at_step: model.card.short_logits_at_step,
            fail_decode_at_step: model.card.fail_decode_at_step,
            fail_prompt_decode: model.card.fail_prompt_decode,
            position: 0,
            prompt_end: 0,
            pending: None,
            logits: None,
            stats: self.stats.clone(),
        })
    }
}
