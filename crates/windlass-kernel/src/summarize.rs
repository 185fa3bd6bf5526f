//! The summarisation kernel: narrative recaps and short titles for a
//! conversation history. Shares worker 0's model replica unless the
//! configuration names a dedicated summariser model.

use std::time::Instant;

use serde_json::json;
use windlass_proto::{SummaryOutcome, TitleOutcome};
use windlass_types::tokens::CHARS_PER_TOKEN;
use windlass_types::{ChatMessage, Role, SamplingParams};

use crate::error::KernelError;
use crate::runtime::ModelRuntime;
use crate::thinking::split_thinking;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a precise conversation summarizer. Write a factual, \
concise narrative of the conversation so far, covering the user's intent, the decisions made, \
the open questions, and any constraints that were stated. Do not invent details and do not add \
commentary.";

const TITLE_SYSTEM_PROMPT: &str = "Suggest a very short title for this conversation, at most a \
few words. Reply with the title only.";

pub const DEFAULT_TITLE_MAX_TOKENS: u32 = 24;

pub struct SummarizerKernel {
    runtime: Box<dyn ModelRuntime>,
    context_size: u32,
}

impl SummarizerKernel {
    pub fn new(runtime: Box<dyn ModelRuntime>) -> Self {
        let context_size = runtime.context_size();
        Self {
            runtime,
            context_size,
        }
    }

    /// Produce a narrative summary of `history`.
    ///
    /// The formatted history is truncated (oldest content first) to at
    /// most half the context window by the character estimate before the
    /// model sees it.
    pub fn summarize(
        &mut self,
        history: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<SummaryOutcome, KernelError> {
        let formatted = format_history(history);
        let budget = (f64::from(self.context_size) / 2.0 * CHARS_PER_TOKEN) as usize;
        let (kept, truncated) = tail_chars(&formatted, budget);

        let prompt = format!("{SUMMARY_SYSTEM_PROMPT}\n\nConversation:\n{kept}\n\nSummary:");
        let params = SamplingParams::summarization(max_tokens);
        let started = Instant::now();
        let text = self.run(&prompt, &params)?;

        Ok(SummaryOutcome {
            narrative_summary: text,
            metadata: json!({
                "source_messages": history.len(),
                "truncated": truncated,
                "model_ms": started.elapsed().as_millis() as u64,
            }),
        })
    }

    /// Produce a short title for `history`; trailing punctuation is
    /// trimmed off.
    pub fn suggest_title(
        &mut self,
        history: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<TitleOutcome, KernelError> {
        let formatted = format_history(history);
        let budget = (f64::from(self.context_size) / 2.0 * CHARS_PER_TOKEN) as usize;
        let (kept, truncated) = tail_chars(&formatted, budget);

        let prompt = format!("{TITLE_SYSTEM_PROMPT}\n\nConversation:\n{kept}\n\nTitle:");
        let params = SamplingParams::summarization(max_tokens);
        let started = Instant::now();
        let text = self.run(&prompt, &params)?;
        let title = text
            .trim()
            .trim_end_matches(['.', '!', '?', ',', ':', ';', '"', '\''])
            .trim()
            .to_owned();

        Ok(TitleOutcome {
            suggested_title: title,
            metadata: json!({
                "source_messages": history.len(),
                "truncated": truncated,
                "model_ms": started.elapsed().as_millis() as u64,
            }),
        })
    }

    fn run(&mut self, prompt: &str, params: &SamplingParams) -> Result<String, KernelError> {
        let mut raw = String::new();
        self.runtime
            .generate(prompt, params, &mut |piece| {
                raw.push_str(piece);
                true
            })
            .map_err(KernelError::Runtime)?;
        Ok(split_thinking(&raw).text)
    }
}

fn format_history(history: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in history {
        let tag = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push_str(tag);
        out.push_str(": ");
        out.push_str(&message.content);
        out.push('\n');
    }
    out
}

/// Keep at most the last `budget` characters of `text`, on a char
/// boundary. Returns the kept slice and whether truncation happened.
fn tail_chars(text: &str, budget: usize) -> (&str, bool) {
    if text.len() <= budget {
        return (text, false);
    }
    let mut start = text.len() - budget;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    (&text[start..], true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SyntheticRuntime;

    fn summarizer(context: u32) -> SummarizerKernel {
        SummarizerKernel::new(Box::new(SyntheticRuntime::new(context)))
    }

    fn history() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("How do I parse a GGUF header?"),
            ChatMessage::assistant("Read the magic, then the key/value table."),
        ]
    }

    #[test]
    fn summary_has_text_and_metadata() {
        let mut s = summarizer(4096);
        let outcome = s.summarize(&history(), 128).unwrap();
        assert!(!outcome.narrative_summary.is_empty());
        assert_eq!(outcome.metadata["source_messages"], 2);
        assert_eq!(outcome.metadata["truncated"], false);
    }

    #[test]
    fn long_histories_are_truncated_to_half_context() {
        let mut s = summarizer(64); // 32 tokens → 112 chars of history budget
        let long = vec![ChatMessage::user("y".repeat(10_000))];
        let outcome = s.summarize(&long, 16).unwrap();
        assert_eq!(outcome.metadata["truncated"], true);
    }

    #[test]
    fn title_trims_trailing_punctuation() {
        let mut s = summarizer(4096);
        let outcome = s.suggest_title(&history(), DEFAULT_TITLE_MAX_TOKENS).unwrap();
        assert!(!outcome.suggested_title.is_empty());
        assert!(!outcome.suggested_title.ends_with('.'));
    }
}
