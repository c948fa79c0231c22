//! Thread-safe service object.
//!
//! [`RagService`] bundles the resource manager and the knowledge store behind
//! one mutex. Every operation holds that lock for its whole duration, so
//! queries run one at a time and knowledge writes never interleave with a
//! query.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use llama_engine::InferenceBackend;
use llama_rag::KnowledgeStore;
use llama_sampling::TokenSampler;
use uuid::Uuid;

use crate::config::GenerationConfig;
use crate::generate::{GenerationOutcome, Generator};
use crate::lifecycle::{InitError, LifecycleState, ResourceManager};
use crate::telemetry::TelemetryHook;

struct State<B: InferenceBackend> {
    manager: ResourceManager<B>,
    store: KnowledgeStore,
}

/// Model, knowledge and generator behind a single lock.
pub struct RagService<B: InferenceBackend> {
    state: Mutex<State<B>>,
    generator: Generator,
}

impl<B: InferenceBackend> RagService<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, GenerationConfig::default())
    }

    pub fn with_config(backend: B, config: GenerationConfig) -> Self {
        let manager = ResourceManager::with_params(backend, config.context_params());
        Self {
            state: Mutex::new(State {
                manager,
                store: KnowledgeStore::new(),
            }),
            generator: Generator::new(config),
        }
    }

    pub fn with_telemetry(mut self, hook: impl TelemetryHook + 'static) -> Self {
        self.generator = self.generator.with_telemetry(hook);
        self
    }

    /// See [`Generator::with_sampler_factory`].
    pub fn with_sampler_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn TokenSampler> + Send + Sync + 'static,
    {
        self.generator = self.generator.with_sampler_factory(factory);
        self
    }

    pub fn config(&self) -> &GenerationConfig {
        self.generator.config()
    }

    // A panic inside a query leaves nothing half-written that a later call
    // could trip over, so a poisoned lock is taken over as is.
    fn lock(&self) -> MutexGuard<'_, State<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the model once; later calls succeed without reloading.
    pub fn initialize(&self, model_path: impl AsRef<Path>) -> Result<(), InitError> {
        self.lock().manager.initialize(model_path)
    }

    pub fn is_ready(&self) -> bool {
        self.lock().manager.is_ready()
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().manager.state()
    }

    /// Release the model and context. The knowledge store is kept.
    pub fn close(&self) {
        self.lock().manager.close();
    }

    /// Append one document; empty text is ignored.
    pub fn add_knowledge(&self, text: impl Into<String>) -> bool {
        self.lock().store.add_document(text)
    }

    /// Append every non-empty line of `path`; unreadable files add nothing.
    pub fn load_knowledge_file(&self, path: impl AsRef<Path>) -> usize {
        self.lock().store.load_file(path)
    }

    /// Like [`load_knowledge_file`](Self::load_knowledge_file) but reports I/O errors.
    pub fn try_load_knowledge_file(&self, path: impl AsRef<Path>) -> llama_rag::Result<usize> {
        self.lock().store.try_load_file(path)
    }

    pub fn knowledge_len(&self) -> usize {
        self.lock().store.len()
    }

    /// Answer `prompt` with the plain response text.
    pub fn query(&self, prompt: &str) -> String {
        self.query_outcome(prompt).into_text()
    }

    /// Answer `prompt`, keeping the stop reason and metrics.
    pub fn query_outcome(&self, prompt: &str) -> GenerationOutcome {
        let query_id = Uuid::new_v4();
        let span = tracing::info_span!("query", %query_id);
        let _enter = span.enter();

        let mut guard = self.lock();
        let state = &mut *guard;
        self.generator
            .generate(&mut state.manager, &state.store, prompt)
    }
}

impl<B: InferenceBackend> fmt::Debug for RagService<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RagService")
            .field("manager", &state.manager)
            .field("documents", &state.store.len())
            .field("generator", &self.generator)
            .finish()
    }
}
