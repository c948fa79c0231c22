//! Model/context lifecycle.
//!
//! [`ResourceManager`] owns at most one loaded model and one decode context
//! built on it. Initialization happens once; later calls are no-ops until
//! [`close`](ResourceManager::close). The context is always released before
//! the model it was built from.

use std::fmt;
use std::path::{Path, PathBuf};

use llama_engine::{ContextParams, InferenceBackend, LlamaError, Model};

/// Vocabulary type exposed by a backend's models.
pub type VocabOf<B> = <<B as InferenceBackend>::Model as Model>::Vocab;

/// Where the manager is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
    /// Last initialization attempt failed; another attempt may follow.
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Loading => "loading",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Initialization failures.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("model file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("failed to load model: {0}")]
    ModelLoadFailed(#[source] LlamaError),

    #[error("failed to create inference context: {0}")]
    ContextCreateFailed(#[source] LlamaError),
}

impl InitError {
    /// Integer status reported across the C boundary (success is 0).
    pub fn status_code(&self) -> i32 {
        match self {
            InitError::FileNotFound { .. } => 10,
            InitError::ModelLoadFailed(_) => 1,
            InitError::ContextCreateFailed(_) => 2,
        }
    }
}

/// Simultaneous borrows of the vocabulary and the decode context.
pub struct Handles<'a, B: InferenceBackend> {
    /// `None` when the model ships without a vocabulary.
    pub vocab: Option<&'a VocabOf<B>>,
    pub context: &'a mut B::Context,
    /// Capacity of `context` in positions.
    pub n_ctx: u32,
}

/// Owner of the model and context handles.
///
/// Field order matters: `context` is declared before `model` so it is also
/// dropped first.
pub struct ResourceManager<B: InferenceBackend> {
    backend: B,
    params: ContextParams,
    context: Option<B::Context>,
    model: Option<B::Model>,
    model_path: Option<PathBuf>,
    state: LifecycleState,
}

impl<B: InferenceBackend> ResourceManager<B> {
    pub fn new(backend: B) -> Self {
        Self::with_params(backend, ContextParams::default())
    }

    pub fn with_params(backend: B, params: ContextParams) -> Self {
        Self {
            backend,
            params,
            context: None,
            model: None,
            model_path: None,
            state: LifecycleState::Uninitialized,
        }
    }

    /// Load the model at `path` and build a context on it.
    ///
    /// Returns `Ok(())` without touching anything when already ready, even
    /// for a different path.
    pub fn initialize(&mut self, path: impl AsRef<Path>) -> Result<(), InitError> {
        let path = path.as_ref();

        if self.is_ready() {
            if self.model_path.as_deref() != Some(path) {
                tracing::warn!(
                    requested = %path.display(),
                    loaded = ?self.model_path,
                    "already initialized; ignoring new model path"
                );
            }
            return Ok(());
        }

        self.state = LifecycleState::Loading;
        tracing::info!(backend = self.backend.name(), path = %path.display(), "loading model");

        if !path.is_file() {
            self.state = LifecycleState::Failed;
            return Err(InitError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let model = match self.backend.load_model(path) {
            Ok(model) => model,
            Err(err) => {
                self.state = LifecycleState::Failed;
                tracing::warn!(error = %err, "model load failed");
                return Err(InitError::ModelLoadFailed(err));
            }
        };

        let context = match self.backend.new_context(&model, &self.params) {
            Ok(ctx) => ctx,
            Err(err) => {
                drop(model);
                self.state = LifecycleState::Failed;
                tracing::warn!(error = %err, "context creation failed");
                return Err(InitError::ContextCreateFailed(err));
            }
        };

        tracing::info!(
            model = %model.describe(),
            n_ctx = self.params.n_ctx,
            "model ready"
        );
        self.context = Some(context);
        self.model = Some(model);
        self.model_path = Some(path.to_path_buf());
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.model.is_some() && self.context.is_some()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Path of the loaded model.
    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn vocabulary(&self) -> Option<&VocabOf<B>> {
        self.model.as_ref().and_then(|m| m.vocab())
    }

    pub fn decode_handle(&mut self) -> Option<&mut B::Context> {
        self.context.as_mut()
    }

    /// Vocabulary and context together; `None` unless ready.
    pub fn handles(&mut self) -> Option<Handles<'_, B>> {
        let model = self.model.as_ref()?;
        let context = self.context.as_mut()?;
        Some(Handles {
            vocab: model.vocab(),
            context,
            n_ctx: self.params.n_ctx,
        })
    }

    /// Release context then model. Safe to call repeatedly.
    pub fn close(&mut self) {
        let was_ready = self.is_ready();
        self.context = None;
        self.model = None;
        self.model_path = None;
        self.state = LifecycleState::Uninitialized;
        if was_ready {
            tracing::info!("model released");
        }
    }
}

impl<B: InferenceBackend> Drop for ResourceManager<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: InferenceBackend> fmt::Debug for ResourceManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("model_path", &self.model_path)
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let not_found = InitError::FileNotFound {
            path: PathBuf::from("missing.gguf"),
        };
        assert_eq!(not_found.status_code(), 10);
        assert_eq!(
            InitError::ModelLoadFailed(LlamaError::ModelLoad("bad".into())).status_code(),
            1
        );
        assert_eq!(
            InitError::ContextCreateFailed(LlamaError::ContextCreate("oom".into())).status_code(),
            2
        );
    }

    #[test]
    fn error_messages_carry_cause() {
        let err = InitError::ModelLoadFailed(LlamaError::ModelLoad("truncated".into()));
        assert_eq!(
            err.to_string(),
            "failed to load model: Model loading failed: truncated"
        );
        let err = InitError::FileNotFound {
            path: PathBuf::from("/nope/model.gguf"),
        };
        assert_eq!(err.to_string(), "model file not found: /nope/model.gguf");
    }

    #[test]
    fn state_display() {
        assert_eq!(LifecycleState::Ready.to_string(), "ready");
        assert_eq!(LifecycleState::Uninitialized.to_string(), "uninitialized");
    }
}
