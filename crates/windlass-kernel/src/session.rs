//! The in-worker session kernel: one model replica plus the message logs
//! and token accounting of every session pinned to this worker.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;
use windlass_proto::{CreateOutcome, CreateStatus, DecodeOutcome, PrefillOutcome, SessionSnapshot,
    WorkerStats};
use windlass_types::tokens::estimate_tokens;
use windlass_types::{ChatMessage, Role, SamplingParams, SessionId};

use crate::error::KernelError;
use crate::runtime::ModelRuntime;
use crate::thinking::split_thinking;
use crate::truncate::prune_messages;

struct SessionEntry {
    messages: Vec<ChatMessage>,
    prompt_tokens_total: u64,
    completion_tokens_total: u64,
    last_activity: Instant,
}

impl SessionEntry {
    fn new(system_prompt: Option<String>) -> Self {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::system(system));
        }
        Self {
            messages,
            prompt_tokens_total: 0,
            completion_tokens_total: 0,
            last_activity: Instant::now(),
        }
    }
}

/// Everything a generation run produces, before it is shaped into a
/// decode result or a stream terminal event.
pub struct DecodeRun {
    pub text: String,
    pub thinking: String,
    pub finish_reason: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Time to first emitted piece.
    pub ttft_ms: u64,
    /// Total wall time of the generation call.
    pub total_ms: u64,
}

pub struct SessionKernel {
    runtime: Box<dyn ModelRuntime>,
    context_size: u32,
    sessions: HashMap<SessionId, SessionEntry>,
    prompt_tokens_total: u64,
    completion_tokens_total: u64,
}

impl SessionKernel {
    pub fn new(runtime: Box<dyn ModelRuntime>) -> Self {
        let context_size = runtime.context_size();
        Self {
            runtime,
            context_size,
            sessions: HashMap::new(),
            prompt_tokens_total: 0,
            completion_tokens_total: 0,
        }
    }

    pub fn context_size(&self) -> u32 {
        self.context_size
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn create_session(
        &mut self,
        sid: SessionId,
        system_prompt: Option<String>,
    ) -> CreateOutcome {
        if self.sessions.contains_key(&sid) {
            return CreateOutcome {
                status: CreateStatus::Exists,
            };
        }
        self.sessions.insert(sid, SessionEntry::new(system_prompt));
        CreateOutcome {
            status: CreateStatus::Created,
        }
    }

    /// Append the user message. No tokenisation and no transformer work
    /// happens here; both are deferred into the next decode.
    pub fn prefill(&mut self, sid: &SessionId, prompt: &str) -> Result<PrefillOutcome, KernelError> {
        let start = Instant::now();
        let entry = self.entry_mut(sid)?;
        entry.messages.push(ChatMessage::user(prompt));
        entry.last_activity = Instant::now();
        Ok(PrefillOutcome {
            prompt_tokens: 0,
            prefill_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Non-streamed generation from the current message log.
    pub fn decode(
        &mut self,
        sid: &SessionId,
        params: &SamplingParams,
    ) -> Result<DecodeOutcome, KernelError> {
        let run = self.run_generation(sid, params, None)?;
        Ok(DecodeOutcome {
            session_id: sid.to_string(),
            text: run.text,
            thinking: run.thinking,
            finish_reason: run.finish_reason,
            prompt_tokens: run.prompt_tokens,
            completion_tokens: run.completion_tokens,
            decode_ms: run.total_ms,
            prefill_ms: None,
        })
    }

    /// Streamed generation. `emit` receives each raw delta in order and
    /// may return `false` to cancel; the cleaned final text is appended
    /// to the log exactly as in [`Self::decode`].
    pub fn decode_stream(
        &mut self,
        sid: &SessionId,
        params: &SamplingParams,
        emit: &mut dyn FnMut(&str) -> bool,
    ) -> Result<DecodeRun, KernelError> {
        self.run_generation(sid, params, Some(emit))
    }

    /// Prefill then decode in a single call.
    pub fn complete(
        &mut self,
        sid: &SessionId,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<DecodeOutcome, KernelError> {
        let prefill = self.prefill(sid, prompt)?;
        let mut outcome = self.decode(sid, params)?;
        outcome.prefill_ms = Some(prefill.prefill_ms);
        Ok(outcome)
    }

    /// Exact tokeniser count with the character-estimate fallback.
    /// Never negative; 0 for empty input.
    pub fn count_tokens(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let exact = self.runtime.count_tokens(text);
        if exact > 0 {
            exact as u32
        } else {
            estimate_tokens(text)
        }
    }

    /// Append already-spoken turns without decoding; used when a resumed
    /// conversation is rehydrated onto a fresh session.
    pub fn replay_turns(
        &mut self,
        sid: &SessionId,
        turns: Vec<ChatMessage>,
    ) -> Result<usize, KernelError> {
        let entry = self.entry_mut(sid)?;
        let mut appended = 0usize;
        for turn in turns {
            // The system message is fixed at position 0 by creation.
            if turn.role == Role::System {
                continue;
            }
            entry.messages.push(turn);
            appended += 1;
        }
        entry.last_activity = Instant::now();
        Ok(appended)
    }

    pub fn evict(&mut self, sid: &SessionId) -> Result<(), KernelError> {
        self.sessions
            .remove(sid)
            .map(|_| debug!(%sid, "session evicted"))
            .ok_or_else(|| KernelError::SessionNotFound { sid: sid.clone() })
    }

    /// Remove the session with the oldest last-activity until the count
    /// is at most `max`. Returns the evicted ids.
    pub fn evict_lru(&mut self, max: usize) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        while self.sessions.len() > max {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|(_, e)| e.last_activity)
                .map(|(sid, _)| sid.clone());
            match oldest {
                Some(sid) => {
                    self.sessions.remove(&sid);
                    evicted.push(sid);
                }
                None => break,
            }
        }
        evicted
    }

    pub fn worker_stats(&self) -> WorkerStats {
        WorkerStats {
            sessions: self.sessions.len(),
            prompt_tokens_total: self.prompt_tokens_total,
            completion_tokens_total: self.completion_tokens_total,
            context_size: self.context_size,
        }
    }

    pub fn session_info(&self, sid: &SessionId) -> Result<SessionSnapshot, KernelError> {
        let entry = self
            .sessions
            .get(sid)
            .ok_or_else(|| KernelError::SessionNotFound { sid: sid.clone() })?;
        Ok(SessionSnapshot {
            session_id: sid.to_string(),
            messages: entry.messages.len(),
            prompt_tokens_total: entry.prompt_tokens_total,
            completion_tokens_total: entry.completion_tokens_total,
            idle_ms: entry.last_activity.elapsed().as_millis() as u64,
        })
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn entry_mut(&mut self, sid: &SessionId) -> Result<&mut SessionEntry, KernelError> {
        self.sessions
            .get_mut(sid)
            .ok_or_else(|| KernelError::SessionNotFound { sid: sid.clone() })
    }

    fn run_generation(
        &mut self,
        sid: &SessionId,
        params: &SamplingParams,
        mut emit: Option<&mut dyn FnMut(&str) -> bool>,
    ) -> Result<DecodeRun, KernelError> {
        let context_size = self.context_size;
        let prompt = {
            let entry = self.entry_mut(sid)?;
            prune_messages(&mut entry.messages, context_size, params.max_tokens);
            entry.last_activity = Instant::now();
            render_prompt(&entry.messages)
        };

        let start = Instant::now();
        let mut first_piece_at: Option<Instant> = None;
        let mut raw = String::new();
        let mut stopped_on_string = false;
        let stops = params.stop.clone();

        let (usage, finish) = self
            .runtime
            .generate(&prompt, params, &mut |piece| {
                if first_piece_at.is_none() {
                    first_piece_at = Some(Instant::now());
                }
                let before = raw.len();
                raw.push_str(piece);
                if let Some(cut) = earliest_stop(&raw, &stops) {
                    // Forward only the part of this piece ahead of the
                    // stop string, then end generation.
                    if let Some(emit) = emit.as_mut() {
                        if cut > before {
                            let _ = emit(&piece[..cut - before]);
                        }
                    }
                    raw.truncate(cut);
                    stopped_on_string = true;
                    return false;
                }
                match emit.as_mut() {
                    Some(emit) => emit(piece),
                    None => true,
                }
            })
            .map_err(KernelError::Runtime)?;

        let total_ms = start.elapsed().as_millis() as u64;
        let ttft_ms = first_piece_at
            .map(|t| t.duration_since(start).as_millis() as u64)
            .unwrap_or(total_ms);

        let mut prompt_tokens = usage.prompt_tokens;
        if prompt_tokens == 0 {
            prompt_tokens = self.count_tokens(&prompt);
        }
        let mut completion_tokens = usage.completion_tokens;
        if completion_tokens == 0 && !raw.is_empty() {
            completion_tokens = self.count_tokens(&raw);
        }

        let split = split_thinking(&raw);
        let finish_reason = if stopped_on_string {
            "stop".to_owned()
        } else {
            finish.as_str().to_owned()
        };

        let entry = self.entry_mut(sid)?;
        entry.messages.push(ChatMessage::assistant(split.text.clone()));
        entry.prompt_tokens_total += u64::from(prompt_tokens);
        entry.completion_tokens_total += u64::from(completion_tokens);
        entry.last_activity = Instant::now();
        self.prompt_tokens_total += u64::from(prompt_tokens);
        self.completion_tokens_total += u64::from(completion_tokens);

        debug!(
            %sid,
            prompt_tokens,
            completion_tokens,
            %finish_reason,
            "decode finished"
        );

        Ok(DecodeRun {
            text: split.text,
            thinking: split.thinking,
            finish_reason,
            prompt_tokens,
            completion_tokens,
            ttft_ms,
            total_ms,
        })
    }
}

fn render_prompt(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let tag = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        out.push_str("<|");
        out.push_str(tag);
        out.push_str("|>\n");
        out.push_str(&message.content);
        out.push('\n');
    }
    out.push_str("<|assistant|>\n");
    out
}

/// Earliest byte offset at which any stop string begins, if one occurs.
fn earliest_stop(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}
