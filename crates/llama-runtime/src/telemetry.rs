//! Telemetry hooks for generation timing.
//!
//! Provides:
//! - [`GenerationMetrics`]: time to first token, tokens/sec, stop reason
//! - [`TelemetryHook`] trait: callbacks fired while a query runs
//! - [`GenerationTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`] / [`TracingTelemetry`]: built-in hooks

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::generate::StopReason;

/// Aggregate metrics from one generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationMetrics {
    /// Time from start until the prompt batch was evaluated, in milliseconds.
    pub ttft_ms: f64,
    /// Tokens generated per second (excludes prompt evaluation).
    pub tokens_per_sec: f64,
    /// Number of prompt tokens evaluated.
    pub prompt_tokens: usize,
    /// Number of tokens accepted into the response.
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
    /// Why the loop ended.
    pub stop: StopReason,
}

/// Callback trait for generation telemetry.
///
/// All methods default to no-ops so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called once the prompt batch has been decoded.
    fn on_prompt_evaluated(&self, _ttft_ms: f64) {}

    /// Called after each accepted token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when generation finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &GenerationMetrics) {}
}

/// Hook that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the last completed run's metrics for later inspection.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<GenerationMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics of the last completed generation.
    pub fn last_metrics(&self) -> Option<GenerationMetrics> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
    }
}

/// Emits an `info` event per completed generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prompt_evaluated(&self, ttft_ms: f64) {
        tracing::debug!(ttft_ms, "prompt evaluated");
    }

    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        tracing::info!(
            prompt_tokens = metrics.prompt_tokens,
            generated_tokens = metrics.generated_tokens,
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            total_time_ms = metrics.total_time_ms,
            stop = ?metrics.stop,
            "generation complete"
        );
    }
}

/// Records timestamps during one query to compute [`GenerationMetrics`].
///
/// Usage:
/// 1. [`GenerationTimer::new`] once the prompt is tokenized
/// 2. [`mark_prompt_evaluated`](Self::mark_prompt_evaluated) after the prompt batch
/// 3. [`mark_token`](Self::mark_token) per accepted token
/// 4. [`finish`](Self::finish) with the stop reason
pub struct GenerationTimer<'h> {
    prompt_tokens: usize,
    start: Instant,
    prompt_end: Option<Instant>,
    token_count: usize,
    hook: &'h dyn TelemetryHook,
}

impl<'h> GenerationTimer<'h> {
    pub fn new(prompt_tokens: usize, hook: &'h dyn TelemetryHook) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            prompt_end: None,
            token_count: 0,
            hook,
        }
    }

    pub fn mark_prompt_evaluated(&mut self) {
        let now = Instant::now();
        self.prompt_end = Some(now);
        let ttft_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prompt_evaluated(ttft_ms);
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Finalize and fire `on_generation_complete`.
    pub fn finish(self, stop: StopReason) -> GenerationMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;

        let ttft_ms = self
            .prompt_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = GenerationMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
            stop,
        };

        self.hook.on_generation_complete(&metrics);
        metrics
    }
}
