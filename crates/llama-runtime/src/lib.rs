//! # llama-runtime
//!
//! Runtime for llama-rag: owns the model/context pair, drives the
//! retrieval-augmented generation loop, and wraps both behind a
//! single-lock service object.
//!
//! - [`lifecycle`]: [`ResourceManager`], single initialization and release order
//! - [`generate`]: [`Generator`], tokenize → prompt decode → sample loop
//! - [`service`]: [`RagService`], one critical section per call
//! - [`config`]: [`GenerationConfig`] and JSON loading
//! - [`telemetry`]: timing hooks
//! - [`scripted`]: deterministic reference backend driven by a JSON model card
//! - `native`: GGUF models through llama.cpp, behind the `native` feature
//! - [`text`]: cleanup of raw vocabulary pieces for display

pub mod config;
pub mod generate;
pub mod lifecycle;
#[cfg(feature = "native")]
pub mod native;
pub mod scripted;
pub mod service;
pub mod telemetry;
pub mod text;

pub use config::{
    load_config, ConfigError, ContextPolicy, GenerationConfig, SamplerKind,
    DEFAULT_CONTEXT_WINDOW, DEFAULT_MAX_NEW_TOKENS,
};
pub use generate::{Diagnostic, GenerationOutcome, Generator, SamplerFactory, StopReason};
pub use lifecycle::{Handles, InitError, LifecycleState, ResourceManager};
#[cfg(feature = "native")]
pub use native::{NativeBackend, NativeContext, NativeModel, NativeVocab};
pub use scripted::{ModelCard, ScriptedBackend, ScriptedStats};
pub use service::RagService;
pub use telemetry::{
    GenerationMetrics, GenerationTimer, LogTelemetry, NoopTelemetry, TelemetryHook,
    TracingTelemetry,
};

/// Backend behind the C ABI and the command line: llama.cpp with the
/// `native` feature, the scripted backend otherwise.
#[cfg(feature = "native")]
pub type DefaultBackend = NativeBackend;

/// Backend behind the C ABI and the command line: llama.cpp with the
/// `native` feature, the scripted backend otherwise.
#[cfg(not(feature = "native"))]
pub type DefaultBackend = ScriptedBackend;
