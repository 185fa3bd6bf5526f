//! Deterministic text generator used by the test suites and smoke
//! deployments. No weights, no I/O, no randomness: the same prompt and
//! parameters always produce the same pieces.

use windlass_types::SamplingParams;

use super::{FinishReason, GenerateUsage, ModelRuntime, RuntimeError};

const REPLY_WORDS: [&str; 13] = [
    "Here", "is", "a", "short", "deterministic", "reply", "covering", "the", "request", "as",
    "far", "as", "possible.",
];

pub struct SyntheticRuntime {
    context_size: u32,
}

impl SyntheticRuntime {
    pub fn new(context_size: u32) -> Self {
        Self { context_size }
    }
}

impl ModelRuntime for SyntheticRuntime {
    fn context_size(&self) -> u32 {
        self.context_size
    }

    fn count_tokens(&self, text: &str) -> usize {
        // A word is roughly one token; long words split into 8-char pieces.
        text.split_whitespace().map(|w| 1 + w.len() / 8).sum()
    }

    fn generate(
        &mut self,
        prompt: &str,
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(GenerateUsage, FinishReason), RuntimeError> {
        let budget = params.max_tokens as usize;
        let mut emitted = 0usize;
        let mut finish = FinishReason::Stop;

        for (i, word) in REPLY_WORDS.iter().enumerate() {
            if emitted >= budget {
                finish = FinishReason::Length;
                break;
            }
            let piece = if i == 0 {
                (*word).to_owned()
            } else {
                format!(" {word}")
            };
            if !emit(&piece) {
                finish = FinishReason::Cancelled;
                break;
            }
            emitted += 1;
        }

        let usage = GenerateUsage {
            prompt_tokens: self.count_tokens(prompt) as u32,
            completion_tokens: emitted as u32,
        };
        Ok((usage, finish))
    }
}
