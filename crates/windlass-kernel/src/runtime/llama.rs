//! llama.cpp runtime behind the `llama-cpp` cargo feature.
//!
//! The kernel keeps the message log authoritative and hands each decode a
//! fully rendered prompt, so every generation ingests its prompt into a
//! fresh llama session; the windlass-level KV affinity lives in the
//! worker process owning this replica.

use llama_cpp::standard_sampler::{SamplerStage, StandardSampler};
use llama_cpp::{LlamaModel, LlamaParams, SessionParams};
use windlass_types::{SamplingParams, WorkerRuntimeConfig};

use super::{FinishReason, GenerateUsage, ModelRuntime, RuntimeError};

pub struct LlamaCppRuntime {
    model: LlamaModel,
    context_size: u32,
    threads: u32,
}

impl LlamaCppRuntime {
    pub fn load(config: &WorkerRuntimeConfig) -> Result<Self, RuntimeError> {
        let path = config.model_path.as_ref().ok_or_else(|| RuntimeError::Load {
            message: "no model path configured for the llama-cpp runtime".to_owned(),
        })?;

        let mut params = LlamaParams::default();
        params.n_gpu_layers = if config.n_gpu_layers < 0 {
            u32::MAX
        } else {
            config.n_gpu_layers as u32
        };

        let model = LlamaModel::load_from_file(path, params).map_err(|e| RuntimeError::Load {
            message: format!("{}: {e}", path.display()),
        })?;

        Ok(Self {
            model,
            context_size: config.context_size,
            threads: config.blas_threads.max(1) as u32,
        })
    }

    fn sampler(params: &SamplingParams) -> StandardSampler {
        let stages = vec![
            SamplerStage::RepetitionPenalty {
                repetition_penalty: params.repeat_penalty,
                frequency_penalty: 0.0,
                presence_penalty: 0.0,
                last_n: 64,
            },
            SamplerStage::TopK(params.top_k as i32),
            SamplerStage::TopP(params.top_p),
            SamplerStage::Temperature(params.temperature),
        ];
        StandardSampler::new_softmax(stages, 1)
    }
}

impl ModelRuntime for LlamaCppRuntime {
    fn context_size(&self) -> u32 {
        self.context_size
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.model
            .tokenize_bytes(text, false, true)
            .map(|tokens| tokens.len())
            .unwrap_or(0)
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(GenerateUsage, FinishReason), RuntimeError> {
        let mut session_params = SessionParams::default();
        session_params.n_ctx = self.context_size;
        session_params.n_threads = self.threads;
        session_params.n_threads_batch = self.threads;

        let mut session =
            self.model
                .create_session(session_params)
                .map_err(|e| RuntimeError::Generate {
                    message: format!("create session: {e}"),
                })?;

        session
            .advance_context(prompt)
            .map_err(|e| RuntimeError::Generate {
                message: format!("prompt ingestion: {e}"),
            })?;
        let prompt_tokens = self.count_tokens(prompt) as u32;

        let max = params.max_tokens as usize;
        let handle = session.start_completing_with(Self::sampler(params), max);

        let mut completion_tokens = 0u32;
        let mut finish = FinishReason::Stop;
        for piece in handle.into_strings() {
            completion_tokens += 1;
            if !emit(&piece) {
                finish = FinishReason::Cancelled;
                break;
            }
        }
        if finish == FinishReason::Stop && completion_tokens as usize >= max {
            finish = FinishReason::Length;
        }

        Ok((
            GenerateUsage {
                prompt_tokens,
                completion_tokens,
            },
            finish,
        ))
    }
}
