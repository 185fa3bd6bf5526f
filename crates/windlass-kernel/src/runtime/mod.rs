//! The model-runtime seam.
//!
//! A [`ModelRuntime`] owns one loaded model replica and exposes exactly
//! what the kernels need: a tokeniser and a cancellable, piecewise text
//! generator. Implementations run on the worker's single kernel thread,
//! so the trait is deliberately synchronous.

mod synthetic;

#[cfg(feature = "llama-cpp")]
mod llama;

use thiserror::Error;
use windlass_types::{RuntimeKind, SamplingParams, WorkerRuntimeConfig};

pub use synthetic::SyntheticRuntime;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to load model: {message}")]
    Load { message: String },

    #[error("generation failed: {message}")]
    Generate { message: String },
}

/// Why a generation stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-generation token or stop string.
    Stop,
    /// `max_tokens` ceiling reached.
    Length,
    /// The caller's emit callback requested a stop.
    Cancelled,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Cancelled => "cancelled",
        }
    }
}

/// Token accounting reported by a runtime after generation.
///
/// Some runtimes omit usage on streamed generation; zero counts here are
/// legal and the kernel re-counts with the tokeniser, then falls back to
/// the character estimate.
#[derive(Clone, Copy, Debug, Default)]
pub struct GenerateUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One loaded model replica.
pub trait ModelRuntime: Send {
    /// The context window of this replica, in tokens.
    fn context_size(&self) -> u32;

    /// Exact tokeniser count for `text`. Implementations without a real
    /// tokeniser return 0 and the kernel applies the character estimate.
    fn count_tokens(&self, text: &str) -> usize;

    /// Generate from `prompt`, invoking `emit` once per text piece in
    /// order. `emit` returning `false` requests a stop; the runtime must
    /// then return with [`FinishReason::Cancelled`].
    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(GenerateUsage, FinishReason), RuntimeError>;
}

/// Construct the runtime selected by the worker configuration.
pub fn build_runtime(config: &WorkerRuntimeConfig) -> Result<Box<dyn ModelRuntime>, RuntimeError> {
    match config.runtime {
        RuntimeKind::Synthetic => Ok(Box::new(SyntheticRuntime::new(config.context_size))),
        #[cfg(feature = "llama-cpp")]
        RuntimeKind::LlamaCpp => Ok(Box::new(llama::LlamaCppRuntime::load(config)?)),
        #[cfg(not(feature = "llama-cpp"))]
        RuntimeKind::LlamaCpp => Err(RuntimeError::Load {
            message: "this worker was built without llama-cpp support".to_owned(),
        }),
    }
}
