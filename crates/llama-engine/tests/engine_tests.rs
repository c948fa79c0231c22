//! Integration tests for llama-engine capability traits and types.
//!
//! Validates:
//! - The backend traits can be implemented by small in-memory backends
//! - Generic code can drive any backend through the traits (narrow waist)
//! - Error types display correctly and carry context
//! - Models and contexts satisfy the Send bounds the runtime relies on

use llama_engine::*;
use std::path::Path;

// ---------------------------------------------------------------------------
// Mock Backends
// ---------------------------------------------------------------------------

/// Word-level vocabulary; id = index.
#[derive(Debug)]
struct WordVocab {
    words: Vec<String>,
}

impl Vocabulary for WordVocab {
    fn n_tokens(&self) -> usize {
        self.words.len()
    }

    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::new();
        if add_special {
            tokens.push(0);
        }
        for word in text.split_whitespace() {
            let id = self
                .words
                .iter()
                .position(|w| w == word)
                .ok_or_else(|| LlamaError::Tokenization(format!("unknown word {word}")))?;
            tokens.push(id as TokenId);
        }
        Ok(tokens)
    }

    fn token_text(&self, token: TokenId) -> Option<String> {
        self.words.get(token as usize).cloned()
    }

    fn eos(&self) -> TokenId {
        1
    }
}

#[derive(Debug)]
struct WordModel {
    vocab: WordVocab,
}

impl Model for WordModel {
    type Vocab = WordVocab;

    fn vocab(&self) -> Option<&WordVocab> {
        Some(&self.vocab)
    }
}

/// Context that always predicts `next` and records every position it saw.
struct CountingContext {
    n_vocab: usize,
    next: TokenId,
    position: Pos,
    logits: Vec<f32>,
    seen: Vec<Pos>,
}

impl DecodeContext for CountingContext {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<()> {
        if batch.first_pos() != Some(self.position) {
            return Err(LlamaError::Decode("position mismatch".to_string()));
        }
        self.seen.extend(batch.entries().iter().map(|e| e.pos));
        self.position += batch.len() as Pos;
        self.logits = vec![0.0; self.n_vocab];
        self.logits[self.next as usize] = 1.0;
        Ok(())
    }

    fn logits(&self) -> Option<&[f32]> {
        if self.logits.is_empty() {
            None
        } else {
            Some(&self.logits)
        }
    }

    fn position(&self) -> Pos {
        self.position
    }

    fn clear_memory(&mut self) {
        self.position = 0;
        self.logits.clear();
        self.seen.clear();
    }
}

struct WordBackend;

impl InferenceBackend for WordBackend {
    type Model = WordModel;
    type Context = CountingContext;

    fn name(&self) -> &str {
        "word"
    }

    fn load_model(&self, path: &Path) -> Result<WordModel> {
        if path.as_os_str().is_empty() {
            return Err(LlamaError::ModelLoad("empty path".to_string()));
        }
        Ok(WordModel {
            vocab: WordVocab {
                words: ["<s>", "</s>", "hello", "world", "llama"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        })
    }

    fn new_context(&self, model: &WordModel, _params: &ContextParams) -> Result<CountingContext> {
        Ok(CountingContext {
            n_vocab: model.vocab.n_tokens(),
            next: 4,
            position: 0,
            logits: Vec::new(),
            seen: Vec::new(),
        })
    }
}

/// A backend that refuses to build contexts.
struct NoContextBackend;

impl InferenceBackend for NoContextBackend {
    type Model = WordModel;
    type Context = CountingContext;

    fn name(&self) -> &str {
        "no-context"
    }

    fn load_model(&self, path: &Path) -> Result<WordModel> {
        WordBackend.load_model(path)
    }

    fn new_context(&self, _model: &WordModel, params: &ContextParams) -> Result<CountingContext> {
        Err(LlamaError::ContextCreate(format!(
            "cannot allocate {} positions",
            params.n_ctx
        )))
    }
}

/// Generic driver: decode a prompt and return the argmax of the logits.
fn greedy_next<B: InferenceBackend>(backend: &B, prompt: &str) -> Result<TokenId> {
    let model = backend.load_model(Path::new("model.bin"))?;
    let mut ctx = backend.new_context(&model, &ContextParams::default())?;
    let vocab = model
        .vocab()
        .ok_or_else(|| LlamaError::Tokenization("no vocab".to_string()))?;
    let tokens = vocab.tokenize(prompt, true, true)?;
    ctx.decode(&DecodeBatch::for_prompt(&tokens, 0))?;
    let logits = ctx.logits().expect("logits after decode");
    let best = logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as TokenId)
        .unwrap();
    Ok(best)
}

// ---------------------------------------------------------------------------
// Trait Implementation Tests
// ---------------------------------------------------------------------------

#[test]
fn word_backend_load_model() {
    let model = WordBackend.load_model(Path::new("/models/tiny.gguf")).unwrap();
    assert_eq!(model.vocab().unwrap().n_tokens(), 5);
    assert_eq!(model.describe(), "model");
}

#[test]
fn word_backend_load_model_empty_path_errors() {
    let err = WordBackend.load_model(Path::new("")).unwrap_err();
    assert!(matches!(err, LlamaError::ModelLoad(_)));
}

#[test]
fn vocabulary_tokenize_adds_special_marker() {
    let model = WordBackend.load_model(Path::new("m")).unwrap();
    let vocab = model.vocab().unwrap();
    assert_eq!(vocab.tokenize("hello world", true, true).unwrap(), vec![0, 2, 3]);
    assert_eq!(vocab.tokenize("hello world", false, true).unwrap(), vec![2, 3]);
}

#[test]
fn vocabulary_token_text() {
    let model = WordBackend.load_model(Path::new("m")).unwrap();
    let vocab = model.vocab().unwrap();
    assert_eq!(vocab.token_text(4).as_deref(), Some("llama"));
    assert_eq!(vocab.token_text(99), None);
    assert_eq!(vocab.eos(), 1);
}

#[test]
fn context_tracks_positions_and_clears() {
    let model = WordBackend.load_model(Path::new("m")).unwrap();
    let mut ctx = WordBackend
        .new_context(&model, &ContextParams::default())
        .unwrap();
    assert!(ctx.logits().is_none());

    ctx.decode(&DecodeBatch::for_prompt(&[0, 2, 3], 0)).unwrap();
    ctx.decode(&DecodeBatch::single(4, 3)).unwrap();
    assert_eq!(ctx.position(), 4);
    assert_eq!(ctx.seen, vec![0, 1, 2, 3]);

    // Restarting at 0 without clearing is a position mismatch.
    let err = ctx.decode(&DecodeBatch::for_prompt(&[0], 0)).unwrap_err();
    assert!(matches!(err, LlamaError::Decode(_)));

    ctx.clear_memory();
    assert_eq!(ctx.position(), 0);
    assert!(ctx.decode(&DecodeBatch::for_prompt(&[0], 0)).is_ok());
}

// ---------------------------------------------------------------------------
// Pluggable Backend Tests (Narrow Waist Pattern)
// ---------------------------------------------------------------------------

#[test]
fn generic_driver_runs_against_any_backend() {
    assert_eq!(greedy_next(&WordBackend, "hello world").unwrap(), 4);
}

#[test]
fn generic_driver_surfaces_context_errors() {
    let err = greedy_next(&NoContextBackend, "hello").unwrap_err();
    assert!(matches!(err, LlamaError::ContextCreate(_)));
    assert!(err.to_string().contains("544"));
}

#[test]
fn backends_report_names() {
    assert_eq!(WordBackend.name(), "word");
    assert_eq!(NoContextBackend.name(), "no-context");
}

// ---------------------------------------------------------------------------
// Error & Bound Tests
// ---------------------------------------------------------------------------

#[test]
fn error_display() {
    assert_eq!(
        LlamaError::ModelLoad("bad magic".to_string()).to_string(),
        "Model loading failed: bad magic"
    );
    assert_eq!(
        LlamaError::Decode("kv cache full".to_string()).to_string(),
        "Decode failed: kv cache full"
    );
    assert_eq!(
        LlamaError::BatchFull { capacity: 8 }.to_string(),
        "Batch capacity exceeded: 8 tokens"
    );
}

#[test]
fn models_and_contexts_are_send() {
    fn assert_send<T: Send>() {}
    assert_send::<WordModel>();
    assert_send::<CountingContext>();
    assert_send::<DecodeBatch>();
    assert_send::<LlamaError>();
}

#[test]
fn backends_are_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<WordBackend>();
}

#[test]
fn default_context_params_fit_window_and_budget() {
    assert_eq!(ContextParams::default().n_ctx, 512 + 32);
}
