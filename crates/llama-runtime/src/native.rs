//! GGUF models through llama.cpp (`native` feature).
//!
//! llama.cpp contexts borrow their model and are not `Send`, so each
//! [`NativeContext`] is a handle to a dedicated decode thread that owns the
//! real context. The thread holds its own reference to the model and builds
//! the context on its stack; requests and logits travel over channels.
//! Dropping the handle joins the thread, which frees the context before the
//! caller gets to drop the model.
//!
//! The vocabulary is read directly from the shared model on the caller's
//! thread.

use std::fmt;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::token::LlamaToken;
use llama_engine::{
    BatchEntry, ContextParams, DecodeBatch, DecodeContext, InferenceBackend, LlamaError, Model,
    Pos, Result, TokenId, Vocabulary,
};

/// Longest piece rendered for a single token, in bytes.
const PIECE_BUFFER: usize = 64;

/// llama.cpp keeps global state and may only be initialized once per process.
static LLAMA_BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

fn llama_backend() -> std::result::Result<&'static LlamaBackend, String> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    result
        .as_ref()
        .map_err(|e| format!("llama.cpp backend unavailable: {e}"))
}

/// Loads GGUF files with llama.cpp.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend {
    gpu_layers: Option<u32>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offload this many layers; llama.cpp's default applies otherwise.
    pub fn with_gpu_layers(mut self, layers: u32) -> Self {
        self.gpu_layers = Some(layers);
        self
    }
}

impl InferenceBackend for NativeBackend {
    type Model = NativeModel;
    type Context = NativeContext;

    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn load_model(&self, path: &Path) -> Result<NativeModel> {
        let backend = llama_backend().map_err(LlamaError::ModelLoad)?;
        let params = match self.gpu_layers {
            Some(layers) => LlamaModelParams::default().with_n_gpu_layers(layers),
            None => LlamaModelParams::default(),
        };
        let model = LlamaModel::load_from_file(backend, path, &params)
            .map_err(|e| LlamaError::ModelLoad(format!("{}: {e}", path.display())))?;

        let n_vocab = usize::try_from(model.n_vocab()).unwrap_or(0);
        let eos = model.token_eos().0;
        tracing::info!(path = %path.display(), n_vocab, "gguf model loaded");

        Ok(NativeModel {
            vocab: NativeVocab {
                model: Arc::new(model),
                n_vocab,
                eos,
            },
        })
    }

    fn new_context(&self, model: &NativeModel, params: &ContextParams) -> Result<NativeContext> {
        let n_ctx = NonZeroU32::new(params.n_ctx)
            .ok_or_else(|| LlamaError::ContextCreate("n_ctx must be positive".into()))?;
        let shared = Arc::clone(&model.vocab.model);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (request_tx, request_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("llama-decode".into())
            .spawn(move || decode_worker(shared, n_ctx, ready_tx, request_rx))
            .map_err(|e| LlamaError::ContextCreate(format!("cannot start decode thread: {e}")))?;

        let setup = ready_rx.recv().unwrap_or_else(|_| {
            Err(LlamaError::ContextCreate(
                "decode thread exited during setup".into(),
            ))
        });
        if let Err(err) = setup {
            let _ = worker.join();
            return Err(err);
        }

        Ok(NativeContext {
            requests: Some(request_tx),
            worker: Some(worker),
            n_ctx: n_ctx.get(),
            position: 0,
            logits: None,
        })
    }
}

/// Tokenizer backed by the model's own vocabulary.
pub struct NativeVocab {
    model: Arc<LlamaModel>,
    n_vocab: usize,
    eos: TokenId,
}

impl Vocabulary for NativeVocab {
    fn n_tokens(&self) -> usize {
        self.n_vocab
    }

    // llama-cpp-2 always parses special-token text, so `parse_special` has no
    // effect here.
    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<TokenId>> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| LlamaError::Tokenization(e.to_string()))?;
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn token_text(&self, token: TokenId) -> Option<String> {
        let in_range = usize::try_from(token).is_ok_and(|i| i < self.n_vocab);
        if !in_range {
            return None;
        }
        self.model
            .token_to_piece_bytes(LlamaToken(token), PIECE_BUFFER, true, None)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos(&self) -> TokenId {
        self.eos
    }
}

impl fmt::Debug for NativeVocab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeVocab")
            .field("n_vocab", &self.n_vocab)
            .field("eos", &self.eos)
            .finish_non_exhaustive()
    }
}

/// A loaded GGUF model.
#[derive(Debug)]
pub struct NativeModel {
    vocab: NativeVocab,
}

impl Model for NativeModel {
    type Vocab = NativeVocab;

    fn vocab(&self) -> Option<&NativeVocab> {
        Some(&self.vocab)
    }

    fn describe(&self) -> String {
        format!(
            "gguf model ({} tokens, trained on {} positions)",
            self.vocab.n_vocab,
            self.vocab.model.n_ctx_train()
        )
    }
}

enum Request {
    Decode {
        entries: Vec<BatchEntry>,
        reply: Sender<Result<Option<Vec<f32>>>>,
    },
    Clear,
}

/// Handle to a llama.cpp context living on its decode thread.
pub struct NativeContext {
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    n_ctx: u32,
    position: Pos,
    logits: Option<Vec<f32>>,
}

fn worker_gone() -> LlamaError {
    LlamaError::Decode("decode thread is gone".into())
}

impl NativeContext {
    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or_else(worker_gone)?
            .send(request)
            .map_err(|_| worker_gone())
    }
}

impl DecodeContext for NativeContext {
    fn decode(&mut self, batch: &DecodeBatch) -> Result<()> {
        let Some(last) = batch.last_pos() else {
            return Err(LlamaError::Decode("empty batch".into()));
        };
        if last < 0 || last as u32 >= self.n_ctx {
            return Err(LlamaError::Decode(format!(
                "position {last} exceeds context of {} tokens",
                self.n_ctx
            )));
        }

        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Request::Decode {
            entries: batch.entries().to_vec(),
            reply: reply_tx,
        })?;
        match reply_rx.recv().map_err(|_| worker_gone())? {
            Ok(logits) => {
                self.logits = logits;
                self.position = last + 1;
                Ok(())
            }
            Err(err) => {
                self.logits = None;
                Err(err)
            }
        }
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }

    fn position(&self) -> Pos {
        self.position
    }

    fn clear_memory(&mut self) {
        if self.send(Request::Clear).is_err() {
            tracing::warn!("decode thread is gone; nothing to clear");
        }
        self.position = 0;
        self.logits = None;
    }
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        // closing the channel ends the worker loop
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("decode thread panicked");
            }
        }
    }
}

impl fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeContext")
            .field("n_ctx", &self.n_ctx)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

fn decode_worker(
    model: Arc<LlamaModel>,
    n_ctx: NonZeroU32,
    ready: Sender<Result<()>>,
    requests: Receiver<Request>,
) {
    let setup = llama_backend()
        .map_err(LlamaError::ContextCreate)
        .and_then(|backend| {
            let params = LlamaContextParams::default()
                .with_n_ctx(Some(n_ctx))
                .with_n_batch(n_ctx.get());
            model
                .new_context(backend, params)
                .map_err(|e| LlamaError::ContextCreate(e.to_string()))
        });
    let mut ctx = match setup {
        Ok(ctx) => {
            let _ = ready.send(Ok(()));
            ctx
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    for request in requests {
        match request {
            Request::Decode { entries, reply } => {
                let _ = reply.send(decode_entries(&mut ctx, &entries));
            }
            Request::Clear => ctx.clear_kv_cache(),
        }
    }
    tracing::debug!("decode thread finished");
}

/// Logits of the last entry that asked for them, if any did.
fn decode_entries(ctx: &mut LlamaContext<'_>, entries: &[BatchEntry]) -> Result<Option<Vec<f32>>> {
    let mut batch = LlamaBatch::new(entries.len().max(1), 1);
    for entry in entries {
        batch
            .add(LlamaToken(entry.token), entry.pos, &[entry.seq_id], entry.logits)
            .map_err(|e| LlamaError::Decode(e.to_string()))?;
    }
    ctx.decode(&mut batch)
        .map_err(|e| LlamaError::Decode(e.to_string()))?;

    let Some(index) = entries.iter().rposition(|e| e.logits) else {
        return Ok(None);
    };
    Ok(Some(ctx.get_logits_ith(index as i32).to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InitError, RagService};
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Set to a small GGUF file to run the end-to-end test.
    const MODEL_ENV: &str = "LLAMA_RAG_TEST_GGUF";

    #[test]
    fn truncated_gguf_is_a_load_failure() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"GGUF\x03\x00\x00\x00").unwrap();

        let err = NativeBackend::new().load_model(file.path()).unwrap_err();
        assert!(matches!(err, LlamaError::ModelLoad(_)));

        let service = RagService::new(NativeBackend::new());
        let err = service.initialize(file.path()).unwrap_err();
        assert!(matches!(err, InitError::ModelLoadFailed(_)));
        assert_eq!(err.status_code(), 1);
    }

    #[test]
    fn real_model_answers() {
        let Some(path) = std::env::var_os(MODEL_ENV) else {
            eprintln!("{MODEL_ENV} not set; skipping");
            return;
        };
        let service = RagService::new(NativeBackend::new());
        service.initialize(&path).unwrap();
        assert!(service.is_ready());

        service.add_knowledge("The office opens at nine in the morning.");
        let outcome = service.query_outcome("When does the office open?");
        assert!(outcome.diagnostic().is_none(), "{}", outcome.text());
        assert!(outcome.metrics().unwrap().prompt_tokens > 1);

        let too_long = vec!["word"; 2048].join(" ");
        assert_eq!(
            service.query(&too_long),
            "Prompt too long for model context window."
        );

        service.close();
        assert!(!service.is_ready());
    }
}
